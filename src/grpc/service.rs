//! Admission service implementation.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::HeaderMap;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::admission_server::Admission;
use super::proto::{CheckRequest, CheckResponse, Code};
use crate::identity::{IdentityResolver, Principal, RequestContext};
use crate::ratelimit::{Decision, Guard, LimitSpec, RateLimiter};

/// Implementation of the `Admission` gRPC interface.
///
/// Lets components outside this process share one limiter: each `Check`
/// counts exactly one request.
pub struct AdmissionServiceImpl {
    limiter: Arc<RateLimiter>,
    resolver: Arc<IdentityResolver>,
}

impl AdmissionServiceImpl {
    pub fn new(limiter: Arc<RateLimiter>, resolver: Arc<IdentityResolver>) -> Self {
        Self { limiter, resolver }
    }

    fn request_context(
        req: &CheckRequest,
        remote_addr: Option<SocketAddr>,
    ) -> Result<RequestContext, Status> {
        let mut ctx = RequestContext::default();

        let principal = req.principal.trim();
        if !principal.is_empty() {
            ctx = ctx.with_principal(Principal::new(principal));
        }

        ctx.peer_addr = if req.peer_addr.is_empty() {
            remote_addr.map(|addr| addr.ip())
        } else {
            Some(parse_peer(&req.peer_addr)?)
        };

        if !req.forwarded_for.is_empty() {
            ctx = ctx.with_forwarded_for(req.forwarded_for.clone());
        }

        Ok(ctx)
    }

    fn limits(req: &CheckRequest) -> Result<Vec<LimitSpec>, Status> {
        req.limits
            .iter()
            .map(|limit| {
                LimitSpec::from_secs(limit.calls, limit.period_seconds)
                    .map_err(|e| Status::invalid_argument(e.to_string()))
            })
            .collect()
    }
}

#[tonic::async_trait]
impl Admission for AdmissionServiceImpl {
    /// Count one request and decide whether it may proceed.
    #[instrument(
        skip(self, request),
        fields(
            scope = %request.get_ref().scope,
            limit_count = request.get_ref().limits.len(),
            skip_default = request.get_ref().skip_default
        )
    )]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let remote_addr = request.remote_addr();
        let req = request.into_inner();

        let limits = Self::limits(&req).map_err(|status| {
            warn!(error = %status.message(), "Received check with an invalid limit");
            status
        })?;
        let ctx = Self::request_context(&req, remote_addr)?;

        if req.skip_default && limits.is_empty() {
            debug!("Check carries no limits and skips the defaults");
        }

        // The scope names the operation; an empty one shares counters
        let mut guard = Guard::new(self.limiter.clone(), self.resolver.clone(), req.scope.trim());
        for spec in limits {
            guard = guard.limit(spec);
        }
        if req.skip_default {
            guard = guard.without_default();
        }

        let response = match guard.admit(&ctx).await {
            Ok(decision) => CheckResponse {
                code: Code::Ok.into(),
                retry_after_seconds: 0,
                headers: header_map(&decision.headers()),
                ..base_response(&decision)
            },
            Err(rejection) => CheckResponse {
                code: Code::OverLimit.into(),
                retry_after_seconds: rejection.retry_after_secs,
                headers: header_map(&rejection.headers()),
                ..base_response(&rejection.decision)
            },
        };

        info!(
            code = Code::try_from(response.code).unwrap_or(Code::Unknown).as_str_name(),
            limit = response.limit,
            remaining = response.remaining,
            failed_open = response.failed_open,
            "Admission decision made"
        );

        Ok(Response::new(response))
    }
}

fn base_response(decision: &Decision) -> CheckResponse {
    CheckResponse {
        code: Code::Unknown.into(),
        limit: decision.limit,
        remaining: decision.remaining,
        reset_at_unix: decision.reset_at.timestamp(),
        retry_after_seconds: 0,
        failed_open: decision.failed_open(),
        headers: HashMap::new(),
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Accepts a bare IP or an `ip:port` socket address.
fn parse_peer(raw: &str) -> Result<IpAddr, Status> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .or_else(|_| raw.parse::<SocketAddr>().map(|addr| addr.ip()))
        .map_err(|_| Status::invalid_argument(format!("peer_addr '{}' is not an IP address", raw)))
}
