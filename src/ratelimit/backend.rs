//! Counter storage abstraction shared by the in-memory and Redis backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::counter::Counter;
use super::limit::LimitSpec;
use super::memory::MemoryStore;
use super::redis_store::RedisStore;
use crate::config::{RateLimitingConfig, StorageBackend};
use crate::error::{Result, TollgateError};

/// Failures of a counter store. All of them are recoverable: the limiter
/// reacts by admitting the request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed counter: {0}")]
    Malformed(String),
}

/// One counter a request is charged against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub key: String,
    pub spec: LimitSpec,
}

impl Charge {
    pub fn new(key: impl Into<String>, spec: LimitSpec) -> Self {
        Self {
            key: key.into(),
            spec,
        }
    }
}

/// Outcome of an all-or-nothing conditional increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    /// Whether the request was counted against every window
    pub admitted: bool,
    /// Counter state after the operation, in the order of the charges.
    /// When the request was refused these are the untouched counts.
    pub counters: Vec<Counter>,
}

/// Storage for fixed-window counters.
///
/// `acquire` is the only operation on the request path. For every charge it
/// resets an expired window, then counts the request in all windows only if
/// every one of them still has room. The whole step is atomic, so concurrent
/// requests from one caller cannot lose updates and a refused request
/// consumes nothing.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a counter without modifying it.
    async fn get(&self, key: &str) -> std::result::Result<Option<Counter>, StoreError>;

    /// Overwrite a counter.
    async fn put(&self, key: &str, counter: Counter) -> std::result::Result<(), StoreError>;

    /// Count one request against every charge, or against none of them.
    async fn acquire(
        &self,
        charges: &[Charge],
        now: DateTime<Utc>,
    ) -> std::result::Result<Acquired, StoreError>;

    /// Whether calls leave the process and may block on the network.
    fn is_remote(&self) -> bool {
        false
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Build the store selected by configuration.
pub fn build_store(config: &RateLimitingConfig) -> Result<Arc<dyn CounterStore>> {
    match config.storage {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                TollgateError::Config("redis_url is required when storage is 'redis'".to_string())
            })?;
            Ok(Arc::new(RedisStore::open(url)?))
        }
    }
}
