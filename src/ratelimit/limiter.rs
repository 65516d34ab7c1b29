//! Core rate limiter implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::backend::{build_store, Acquired, Charge, CounterStore, StoreError};
use super::clock::{Clock, SystemClock};
use super::decision::{Decision, Outcome};
use super::limit::LimitSpec;
use super::memory::MemoryStore;
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::identity::CallerIdentity;

/// Default number of calls per minute when nothing is configured.
pub const DEFAULT_CALLS_PER_MINUTE: u64 = 60;
/// Default bound on one round-trip to the counter store.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);
/// How many store timeouts a detached remote increment may take before it is
/// dropped.
pub const DETACHED_TIMEOUT_FACTOR: u32 = 4;
/// Default prefix of every counter key.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:";

/// Fixed-window rate limiter over a pluggable counter store.
///
/// Built once at startup and shared behind an `Arc`. Every call site that
/// guards an operation uses the same instance, so the process-wide default
/// limits and the per-operation limits count against the same store.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    /// Limits applied to every guarded call unless it opts out
    defaults: Vec<LimitSpec>,
    enabled: bool,
    key_prefix: String,
    store_timeout: Duration,
    fail_open_count: AtomicU64,
}

impl RateLimiter {
    /// Create a rate limiter over `store` with the default limit of
    /// 60 calls per minute.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        let defaults = LimitSpec::per_minute(DEFAULT_CALLS_PER_MINUTE)
            .map(|spec| vec![spec])
            .unwrap_or_default();

        Self {
            store,
            clock: Arc::new(SystemClock),
            defaults,
            enabled: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            fail_open_count: AtomicU64::new(0),
        }
    }

    /// Create a rate limiter with process-local storage.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Build the limiter described by configuration. Invalid default limits
    /// and a missing Redis URL are reported here, never at request time.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let store = build_store(config)?;
        Ok(Self::new(store)
            .with_defaults(config.default_limits()?)
            .with_enabled(config.enabled)
            .with_key_prefix(config.key_prefix.clone())
            .with_store_timeout(Duration::from_millis(config.store_timeout_ms)))
    }

    pub fn with_defaults(mut self, defaults: Vec<LimitSpec>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// The process-wide default limits.
    pub fn defaults(&self) -> &[LimitSpec] {
        &self.defaults
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Current time according to the limiter's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Number of checks admitted because the counter store failed.
    pub fn fail_open_count(&self) -> u64 {
        self.fail_open_count.load(Ordering::Relaxed)
    }

    /// Counter key for an identity under a limit.
    ///
    /// The identity is wrapped in a Redis hash tag so every counter of one
    /// caller lands in the same cluster slot and can be charged in one script.
    pub fn counter_key(&self, identity: &CallerIdentity, spec: &LimitSpec) -> String {
        format!("{}{{{}}}|{}", self.key_prefix, identity, spec.scope_id())
    }

    /// Check one request from `identity` against one limit.
    pub async fn evaluate(&self, identity: &CallerIdentity, spec: &LimitSpec) -> Decision {
        self.evaluate_all(identity, std::slice::from_ref(spec)).await
    }

    /// Check one request against several limits at once.
    ///
    /// Every limit keeps its own counter and all of them must admit the
    /// request: the stricter limit always wins. The request is counted in
    /// every window or in none, so a refused request consumes no budget.
    pub async fn evaluate_all(&self, identity: &CallerIdentity, specs: &[LimitSpec]) -> Decision {
        let now = self.clock.now();

        let mut ordered: Vec<&LimitSpec> = specs.iter().collect();
        ordered.sort_by(|a, b| {
            if a.is_stricter_than(b) {
                std::cmp::Ordering::Less
            } else if b.is_stricter_than(a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });

        let Some(strictest) = ordered.first().copied() else {
            return unlimited(now);
        };

        if !self.enabled {
            return bypassed(strictest, now);
        }

        let charges: Vec<Charge> = ordered
            .iter()
            .map(|spec| Charge::new(self.counter_key(identity, spec), (*spec).clone()))
            .collect();
        trace!(
            identity = %identity,
            counters = charges.len(),
            backend = self.store.name(),
            "Checking rate limits"
        );

        match self.acquire(charges, now).await {
            Ok(Acquired { admitted, counters }) => {
                let decision = ordered
                    .iter()
                    .zip(&counters)
                    .map(|(spec, counter)| {
                        // On refusal only the full windows reject
                        let full = !admitted && !counter.has_room(spec.calls());
                        Decision {
                            admitted: !full,
                            limit: spec.calls(),
                            remaining: if full { 0 } else { counter.remaining(spec.calls()) },
                            reset_at: counter.expires_at(),
                            scope: spec.scope_id(),
                            outcome: Outcome::Enforced,
                        }
                    })
                    .reduce(Decision::stricter)
                    .unwrap_or_else(|| unlimited(now));

                if !decision.admitted {
                    debug!(
                        identity = %identity,
                        scope = %decision.scope,
                        limit = decision.limit,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(err) => {
                self.fail_open_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    identity = %identity,
                    scope = %strictest.scope_id(),
                    backend = self.store.name(),
                    error = %err,
                    "Counter store unavailable, admitting request"
                );

                Decision {
                    admitted: true,
                    limit: strictest.calls(),
                    remaining: strictest.calls(),
                    reset_at: window_end(now, strictest),
                    scope: strictest.scope_id(),
                    outcome: Outcome::FailedOpen(err.to_string()),
                }
            }
        }
    }

    /// Check one request against the defaults plus `extra` limits.
    ///
    /// `operation` scopes every limit that has no scope of its own, so two
    /// operations with equal budgets, and the defaults applied to each of
    /// them, keep separate counters. With `None` the counters are shared
    /// by every unscoped caller of the same budget.
    pub async fn check(
        &self,
        identity: &CallerIdentity,
        operation: Option<&str>,
        extra: &[LimitSpec],
        include_defaults: bool,
    ) -> Decision {
        let defaults = if include_defaults { self.defaults.as_slice() } else { &[] };

        let mut specs: Vec<LimitSpec> = Vec::with_capacity(defaults.len() + extra.len());
        for spec in defaults.iter().chain(extra) {
            let spec = match (operation, spec.scope()) {
                (Some(operation), None) => spec.clone().with_scope(operation),
                _ => spec.clone(),
            };
            if !specs.contains(&spec) {
                specs.push(spec);
            }
        }

        self.evaluate_all(identity, &specs).await
    }

    /// Run the atomic increment against the store.
    ///
    /// Remote stores run on a spawned task and the caller waits at most
    /// `store_timeout` for it. The task is not aborted when the caller gives
    /// up or is cancelled, so the increment still lands and cancelling
    /// clients cannot dodge the count. It is itself bounded by
    /// `DETACHED_TIMEOUT_FACTOR` times the store timeout, so an unresponsive
    /// store cannot pile up tasks.
    async fn acquire(
        &self,
        charges: Vec<Charge>,
        now: DateTime<Utc>,
    ) -> std::result::Result<Acquired, StoreError> {
        if !self.store.is_remote() {
            return self.store.acquire(&charges, now).await;
        }

        let store = self.store.clone();
        let detached_timeout = self.store_timeout.saturating_mul(DETACHED_TIMEOUT_FACTOR);
        let task = tokio::spawn(async move {
            match tokio::time::timeout(detached_timeout, store.acquire(&charges, now)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(detached_timeout)),
            }
        });

        match tokio::time::timeout(self.store_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Unavailable(join_err.to_string())),
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.store.name())
            .field("defaults", &self.defaults)
            .field("enabled", &self.enabled)
            .field("key_prefix", &self.key_prefix)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn window_end(now: DateTime<Utc>, spec: &LimitSpec) -> DateTime<Utc> {
    chrono::Duration::from_std(spec.period())
        .ok()
        .and_then(|period| now.checked_add_signed(period))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn bypassed(spec: &LimitSpec, now: DateTime<Utc>) -> Decision {
    Decision {
        admitted: true,
        limit: spec.calls(),
        remaining: spec.calls(),
        reset_at: window_end(now, spec),
        scope: spec.scope_id(),
        outcome: Outcome::Bypassed,
    }
}

fn unlimited(now: DateTime<Utc>) -> Decision {
    Decision {
        admitted: true,
        limit: u64::MAX,
        remaining: u64::MAX,
        reset_at: now,
        scope: String::new(),
        outcome: Outcome::Bypassed,
    }
}
