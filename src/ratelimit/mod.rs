//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod decision;
mod guard;
mod limit;
mod limiter;
mod memory;
mod redis_store;

pub use backend::{build_store, Acquired, Charge, CounterStore, StoreError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::Counter;
pub use decision::{
    Decision, Outcome, Rejection, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use guard::{guard, Admitted, Guard, Guarded};
pub use limit::{LimitSpec, TimeUnit};
pub use limiter::{
    RateLimiter, DEFAULT_CALLS_PER_MINUTE, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT,
    DETACHED_TIMEOUT_FACTOR,
};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
