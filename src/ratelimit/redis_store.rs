//! Shared counter store backed by Redis.
//!
//! Each counter is a hash `{start, count, period}` whose TTL equals the window
//! length, so Redis itself evicts finished windows. The conditional increment
//! runs as a Lua script, which Redis executes atomically.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::backend::{Acquired, Charge, CounterStore, StoreError};
use super::counter::Counter;
use crate::error::{Result, TollgateError};

// KEYS[i] is charged with ARGV[2i] calls per ARGV[2i+1] ms; ARGV[1] is now.
// Nothing is incremented unless every window has room.
const ACQUIRE_SCRIPT: &str = r#"
local now_ms = tonumber(ARGV[1])
local starts = {}
local counts = {}
local admitted = 1

for i, key in ipairs(KEYS) do
    local calls = tonumber(ARGV[2 * i])
    local period_ms = tonumber(ARGV[2 * i + 1])

    local start = tonumber(redis.call('HGET', key, 'start'))
    local count = tonumber(redis.call('HGET', key, 'count'))
    if (not start) or (not count) or (now_ms >= start + period_ms) then
        start = now_ms
        count = 0
        redis.call('HSET', key, 'start', start, 'count', 0, 'period', period_ms)
        redis.call('PEXPIRE', key, period_ms)
    end

    starts[i] = start
    counts[i] = count
    if count >= calls then
        admitted = 0
    end
end

if admitted == 1 then
    for i, key in ipairs(KEYS) do
        counts[i] = redis.call('HINCRBY', key, 'count', 1)
    end
end

local reply = {admitted}
for i = 1, #KEYS do
    reply[#reply + 1] = counts[i]
    reply[#reply + 1] = starts[i]
end
return reply
"#;

/// Redis-backed counter store for multi-instance deployments.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the given `redis://` URL.
    ///
    /// Only the URL is validated here. The connection is established on first
    /// use and re-established by the connection manager after failures.
    pub fn open(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            TollgateError::Config(format!("invalid redis_url '{}': {}", redact_url(url), e))
        })?;

        info!(addr = %client.get_connection_info().addr, "Using Redis counter storage");

        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(ACQUIRE_SCRIPT),
        })
    }

    async fn connection(&self) -> std::result::Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to Redis");
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(manager.clone())
    }
}

/// Hide the password, and the user name with it, of a connection URL.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***{}", scheme, &rest[at..]),
        None => url.to_string(),
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> std::result::Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Malformed(format!("window start {} out of range", millis)))
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> std::result::Result<Option<Counter>, StoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, i64> = conn.hgetall(key).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let field = |name: &str| {
            fields
                .get(name)
                .copied()
                .ok_or_else(|| StoreError::Malformed(format!("{} is missing field '{}'", key, name)))
        };

        Ok(Some(Counter {
            count: field("count")?.max(0) as u64,
            window_start: from_millis(field("start")?)?,
            period: Duration::from_millis(field("period")?.max(0) as u64),
        }))
    }

    async fn put(&self, key: &str, counter: Counter) -> std::result::Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let expires_at = to_millis(counter.expires_at());

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(
                key,
                &[
                    ("start", to_millis(counter.window_start)),
                    ("count", counter.count as i64),
                    ("period", counter.period.as_millis() as i64),
                ],
            )
            .ignore()
            .cmd("PEXPIREAT")
            .arg(key)
            .arg(expires_at)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn acquire(
        &self,
        charges: &[Charge],
        now: DateTime<Utc>,
    ) -> std::result::Result<Acquired, StoreError> {
        if charges.is_empty() {
            return Ok(Acquired {
                admitted: true,
                counters: Vec::new(),
            });
        }

        let mut conn = self.connection().await?;

        let mut invocation = self.script.prepare_invoke();
        invocation.arg(to_millis(now));
        for charge in charges {
            invocation
                .key(&charge.key)
                .arg(charge.spec.calls())
                .arg(charge.spec.period().as_millis() as u64);
        }
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;

        if reply.len() != 1 + 2 * charges.len() {
            return Err(StoreError::Malformed(format!(
                "acquire returned {} values for {} counters",
                reply.len(),
                charges.len()
            )));
        }

        let counters = charges
            .iter()
            .zip(reply[1..].chunks(2))
            .map(|(charge, pair)| {
                Ok(Counter {
                    count: pair[0].max(0) as u64,
                    window_start: from_millis(pair[1])?,
                    period: charge.spec.period(),
                })
            })
            .collect::<std::result::Result<Vec<_>, StoreError>>()?;

        Ok(Acquired {
            admitted: reply[0] == 1,
            counters,
        })
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
