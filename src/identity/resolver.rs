//! Resolve a request context into the key it is throttled under.

use std::net::{IpAddr, SocketAddr};

use tracing::warn;

use super::{CallerIdentity, RequestContext};
use crate::config::IdentityConfig;

/// Identity used when a request has neither a principal nor an address.
pub const ANONYMOUS: &str = "anonymous";

/// Turns request contexts into caller identities.
///
/// Whether `X-Forwarded-For` is believed is a deployment decision: it is only
/// read when enabled and when the direct peer is one of the trusted proxies.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    trust_forwarded_for: bool,
    /// Peers allowed to set `X-Forwarded-For`; loopback when empty
    trusted_proxies: Vec<IpAddr>,
}

impl IdentityResolver {
    /// A resolver that only looks at the principal and the direct peer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver for a deployment behind reverse proxies.
    pub fn behind_proxies(trusted_proxies: Vec<IpAddr>) -> Self {
        Self {
            trust_forwarded_for: true,
            trusted_proxies,
        }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        Self {
            trust_forwarded_for: config.trust_forwarded_for,
            trusted_proxies: config.trusted_proxies.clone(),
        }
    }

    /// Resolve the identity for one request. Never fails.
    pub fn identity(&self, ctx: &RequestContext) -> CallerIdentity {
        if let Some(principal) = &ctx.principal {
            let username = principal.username.trim();
            if !username.is_empty() {
                return CallerIdentity::user(username);
            }
        }

        match self.network_origin(ctx) {
            Some(origin) => CallerIdentity::ip(origin),
            None => CallerIdentity::anonymous(),
        }
    }

    fn network_origin(&self, ctx: &RequestContext) -> Option<IpAddr> {
        let peer = ctx.peer_addr;

        if self.trust_forwarded_for && peer.is_some_and(|ip| self.is_trusted_proxy(ip)) {
            if let Some(header) = &ctx.forwarded_for {
                // First entry is the original client
                let first = header.split(',').next().unwrap_or("").trim();

                match parse_forwarded_addr(first) {
                    Some(client) if client.is_loopback() => {
                        warn!(
                            forwarded_for = %first,
                            "Ignoring localhost value in X-Forwarded-For, using peer address"
                        );
                    }
                    Some(client) => return Some(client),
                    None if is_localhost_address(first) => {
                        warn!(
                            forwarded_for = %first,
                            "Ignoring localhost value in X-Forwarded-For, using peer address"
                        );
                    }
                    None => {
                        warn!(
                            forwarded_for = %first,
                            "X-Forwarded-For entry is not an IP address, using peer address"
                        );
                    }
                }
            }
        } else if ctx.forwarded_for.is_some() && self.trust_forwarded_for {
            warn!(peer = ?peer, "Ignoring X-Forwarded-For from untrusted peer");
        }

        peer
    }

    fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        if self.trusted_proxies.is_empty() {
            ip.is_loopback()
        } else {
            self.trusted_proxies.contains(&ip)
        }
    }
}

/// Parse one `X-Forwarded-For` entry: a bare address, `ip:port` or
/// `[v6]:port`.
fn parse_forwarded_addr(entry: &str) -> Option<IpAddr> {
    entry
        .parse::<IpAddr>()
        .or_else(|_| entry.parse::<SocketAddr>().map(|addr| addr.ip()))
        .ok()
}

/// Check if an address string names the local host.
pub fn is_localhost_address(ip: &str) -> bool {
    ip == "::1" || ip.starts_with("127.") || ip.eq_ignore_ascii_case("localhost")
}
