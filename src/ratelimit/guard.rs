//! Guarding operations with rate limits.
//!
//! A [`Guarded`] wraps any async operation so that every call first resolves
//! the caller's identity and checks the limiter:
//!
//! ```rust,ignore
//! let export = guard(&limiter, &resolver, "export", export_report, LimitSpec::from_secs(5, 60)?);
//! match export.call(&ctx, report_id).await {
//!     Ok(admitted) => respond(admitted.value, admitted.headers()),
//!     Err(rejection) => rejection.to_response(),
//! }
//! ```
//!
//! Guards stack: `guarded.guard(other_spec)` adds a budget. Every stacked
//! budget and the limiter's process-wide defaults are enforced together, and
//! the strictest one decides. All of them count per operation name, so
//! `export` and `upload` never eat into each other's budget.

use std::future::Future;
use std::sync::Arc;

use http::HeaderMap;

use super::decision::{Decision, Rejection};
use super::limit::LimitSpec;
use super::limiter::RateLimiter;
use crate::identity::{CallerIdentity, IdentityResolver, RequestContext};

/// An admitted call's result with the decision that let it through.
#[derive(Debug, Clone)]
pub struct Admitted<T> {
    pub value: T,
    pub decision: Decision,
}

impl<T> Admitted<T> {
    /// Advisory rate limit headers for the response.
    pub fn headers(&self) -> HeaderMap {
        self.decision.headers()
    }
}

/// The admission policy of one guarded call site.
#[derive(Debug, Clone)]
pub struct Guard {
    limiter: Arc<RateLimiter>,
    resolver: Arc<IdentityResolver>,
    /// Scope of every limit without one of its own
    operation: Option<String>,
    limits: Vec<LimitSpec>,
    include_defaults: bool,
}

impl Guard {
    /// A guard for `operation` enforcing only the limiter's defaults.
    pub fn new(
        limiter: Arc<RateLimiter>,
        resolver: Arc<IdentityResolver>,
        operation: impl Into<String>,
    ) -> Self {
        let operation = operation.into();
        Self {
            limiter,
            resolver,
            operation: (!operation.is_empty()).then_some(operation),
            limits: Vec::new(),
            include_defaults: true,
        }
    }

    /// A guard whose counters are shared with every other unscoped guard
    /// using the same budgets.
    pub fn unscoped(limiter: Arc<RateLimiter>, resolver: Arc<IdentityResolver>) -> Self {
        Self::new(limiter, resolver, String::new())
    }

    /// The operation name counters are scoped to, if any.
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// Add a budget on top of the ones already enforced.
    pub fn limit(mut self, spec: LimitSpec) -> Self {
        self.limits.push(spec);
        self
    }

    /// Stop applying the process-wide default limits at this call site.
    pub fn without_default(mut self) -> Self {
        self.include_defaults = false;
        self
    }

    /// Limits specific to this call site.
    pub fn limits(&self) -> &[LimitSpec] {
        &self.limits
    }

    /// Resolve the caller and decide whether the call may proceed.
    pub async fn admit(&self, ctx: &RequestContext) -> Result<Decision, Rejection> {
        let identity = self.resolver.identity(ctx);
        self.admit_identity(&identity).await
    }

    /// Decide for an already resolved identity.
    pub async fn admit_identity(&self, identity: &CallerIdentity) -> Result<Decision, Rejection> {
        let decision = self
            .limiter
            .check(
                identity,
                self.operation.as_deref(),
                &self.limits,
                self.include_defaults,
            )
            .await;

        if decision.admitted {
            Ok(decision)
        } else {
            Err(Rejection::new(decision, self.limiter.now()))
        }
    }

    /// Wrap `operation` so every call passes through this guard.
    pub fn wrap<F>(self, operation: F) -> Guarded<F> {
        Guarded {
            guard: self,
            operation,
        }
    }
}

/// An operation that is only invoked when its guard admits the caller.
#[derive(Debug, Clone)]
pub struct Guarded<F> {
    guard: Guard,
    operation: F,
}

impl<F> Guarded<F> {
    /// Stack another budget onto this operation.
    pub fn guard(mut self, spec: LimitSpec) -> Self {
        self.guard = self.guard.limit(spec);
        self
    }

    /// Stop applying the process-wide default limits to this operation.
    pub fn without_default(mut self) -> Self {
        self.guard = self.guard.without_default();
        self
    }

    pub fn policy(&self) -> &Guard {
        &self.guard
    }

    /// Check the caller, then run the operation with `args`.
    ///
    /// The operation is not invoked when the call is rejected.
    pub async fn call<A, Fut, T>(&self, ctx: &RequestContext, args: A) -> Result<Admitted<T>, Rejection>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = T>,
    {
        let decision = self.guard.admit(ctx).await?;
        let value = (self.operation)(args).await;
        Ok(Admitted { value, decision })
    }
}

/// Guard `operation`, named `name`, with `spec` in addition to the limiter's
/// defaults.
pub fn guard<F>(
    limiter: &Arc<RateLimiter>,
    resolver: &Arc<IdentityResolver>,
    name: &str,
    operation: F,
    spec: LimitSpec,
) -> Guarded<F> {
    Guard::new(limiter.clone(), resolver.clone(), name)
        .limit(spec)
        .wrap(operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Principal;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::decision::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn setup(defaults: Vec<LimitSpec>) -> (Arc<RateLimiter>, Arc<IdentityResolver>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_704_067_200, 0).unwrap(),
        ));
        let limiter = RateLimiter::in_memory()
            .with_defaults(defaults)
            .with_clock(clock.clone());
        (Arc::new(limiter), Arc::new(IdentityResolver::new()), clock)
    }

    fn alice() -> RequestContext {
        RequestContext::from_peer("10.1.1.1".parse().unwrap()).with_principal(Principal::new("alice"))
    }

    #[tokio::test]
    async fn test_rejected_call_skips_operation() {
        let (limiter, resolver, _clock) = setup(Vec::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let counted = invocations.clone();
        let op = guard(
            &limiter,
            &resolver,
            "double",
            move |x: u32| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    x * 2
                }
            },
            LimitSpec::from_secs(2, 60).unwrap(),
        );

        assert_eq!(op.call(&alice(), 1).await.unwrap().value, 2);
        assert_eq!(op.call(&alice(), 2).await.unwrap().value, 4);

        let rejection = op.call(&alice(), 3).await.unwrap_err();
        assert_eq!(rejection.retry_after_secs, 60);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_default_and_override_stricter_wins() {
        let (limiter, resolver, clock) = setup(vec![LimitSpec::from_secs(60, 60).unwrap()]);
        let op = guard(&limiter, &resolver, "ping", |_: ()| async { "ok" }, LimitSpec::from_secs(5, 60).unwrap());

        for _ in 0..5 {
            assert!(op.call(&alice(), ()).await.is_ok());
        }
        let rejection = op.call(&alice(), ()).await.unwrap_err();
        assert_eq!(rejection.decision.limit, 5);

        clock.advance(Duration::from_secs(60));
        let admitted = op.call(&alice(), ()).await.unwrap();
        assert_eq!(admitted.headers()[&X_RATELIMIT_LIMIT], "5");
        assert_eq!(admitted.headers()[&X_RATELIMIT_REMAINING], "4");
    }

    #[tokio::test]
    async fn test_stacked_guards_all_enforced() {
        let (limiter, resolver, _clock) = setup(Vec::new());
        let op = guard(&limiter, &resolver, "sync", |_: ()| async {}, LimitSpec::from_secs(10, 60).unwrap())
            .guard(LimitSpec::from_secs(3, 1).unwrap());

        for _ in 0..3 {
            assert!(op.call(&alice(), ()).await.is_ok());
        }
        let rejection = op.call(&alice(), ()).await.unwrap_err();
        assert_eq!(rejection.decision.limit, 3);
        assert_eq!(op.policy().limits().len(), 2);
    }

    #[tokio::test]
    async fn test_default_applies_unless_opted_out() {
        let (limiter, resolver, _clock) = setup(vec![LimitSpec::from_secs(1, 60).unwrap()]);

        let plain = Guard::new(limiter.clone(), resolver.clone(), "plain").wrap(|_: ()| async {});
        assert!(plain.call(&alice(), ()).await.is_ok());
        assert!(plain.call(&alice(), ()).await.is_err());

        let exempt = Guard::new(limiter, resolver, "exempt").without_default().wrap(|_: ()| async {});
        for _ in 0..10 {
            assert!(exempt.call(&alice(), ()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_callers_share_origin_counter() {
        let (limiter, resolver, _clock) = setup(Vec::new());
        let op = guard(&limiter, &resolver, "lookup", |_: ()| async {}, LimitSpec::from_secs(1, 60).unwrap());

        let from = |addr: &str| RequestContext::from_peer(addr.parse().unwrap());

        assert!(op.call(&from("192.0.2.1"), ()).await.is_ok());
        assert!(op.call(&from("192.0.2.1"), ()).await.is_err());
        assert!(op.call(&from("192.0.2.2"), ()).await.is_ok());
    }

    #[tokio::test]
    async fn test_operations_keep_separate_budgets() {
        let (limiter, resolver, _clock) = setup(vec![LimitSpec::from_secs(1, 60).unwrap()]);
        let budget = LimitSpec::from_secs(1, 60).unwrap();

        let export = guard(&limiter, &resolver, "export", |_: ()| async {}, budget.clone());
        let upload = guard(&limiter, &resolver, "upload", |_: ()| async {}, budget.clone());

        assert!(export.call(&alice(), ()).await.is_ok());
        assert!(export.call(&alice(), ()).await.is_err());
        // Neither the equal budget nor the default is shared with `export`
        assert!(upload.call(&alice(), ()).await.is_ok());
        assert_eq!(upload.policy().operation(), Some("upload"));
    }

    #[tokio::test]
    async fn test_unscoped_guards_share_counters() {
        let (limiter, resolver, _clock) = setup(Vec::new());
        let budget = LimitSpec::from_secs(1, 60).unwrap();

        let first = Guard::unscoped(limiter.clone(), resolver.clone()).limit(budget.clone()).wrap(|_: ()| async {});
        let second = Guard::unscoped(limiter, resolver).limit(budget).wrap(|_: ()| async {});

        assert!(first.call(&alice(), ()).await.is_ok());
        assert!(second.call(&alice(), ()).await.is_err());
        assert_eq!(second.policy().operation(), None);
    }

    #[tokio::test]
    async fn test_refused_call_does_not_drain_other_budgets() {
        let (limiter, resolver, clock) = setup(vec![LimitSpec::from_secs(1, 10).unwrap()]);
        let op = guard(&limiter, &resolver, "report", |_: ()| async {}, LimitSpec::from_secs(3, 60).unwrap());

        assert!(op.call(&alice(), ()).await.is_ok());
        // Refused by the 1/10s default; the 3/60s budget must stay at one
        assert!(op.call(&alice(), ()).await.is_err());
        assert!(op.call(&alice(), ()).await.is_err());

        clock.advance(Duration::from_secs(10));
        assert!(op.call(&alice(), ()).await.is_ok());
        clock.advance(Duration::from_secs(10));
        let admitted = op.call(&alice(), ()).await.unwrap();
        assert_eq!(admitted.decision.remaining, 0);
    }
}
