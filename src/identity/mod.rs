//! Caller identity resolution.
//!
//! Every admission check is keyed by a [`CallerIdentity`]: the authenticated
//! principal's username when there is one, otherwise the caller's network
//! origin, otherwise a fixed sentinel.

mod resolver;

pub use resolver::{is_localhost_address, IdentityResolver, ANONYMOUS};

use std::fmt;
use std::net::IpAddr;

/// An authenticated principal attached to a request by upstream auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// What the limiter needs to know about one inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Present when the request was authenticated
    pub principal: Option<Principal>,
    /// Address of the direct TCP peer
    pub peer_addr: Option<IpAddr>,
    /// Raw `X-Forwarded-For` header, if the request carried one
    pub forwarded_for: Option<String>,
}

impl RequestContext {
    /// A context for a request arriving directly from `peer`.
    pub fn from_peer(peer: IpAddr) -> Self {
        Self {
            peer_addr: Some(peer),
            ..Self::default()
        }
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }
}

/// The key a request is throttled under.
///
/// Usernames and addresses live in separate namespaces (`user:` and `ip:`),
/// so a principal named like an address never shares that address's counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    /// A raw key, used as is.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn user(username: &str) -> Self {
        Self(format!("user:{}", username))
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self(format!("ip:{}", addr))
    }

    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerIdentity {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}
