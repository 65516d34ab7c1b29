//! Process-local counter store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::backend::{Acquired, Charge, CounterStore, StoreError};
use super::counter::Counter;

/// In-memory counter store for single-instance deployments.
///
/// Reads go straight to the map. Writes take `write_gate`, so a request
/// charged against several counters is checked and counted in one step and
/// concurrent requests from the same caller are serialized. Expired counters
/// are reset on access; nothing sweeps them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, Counter>,
    write_gate: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of tracked counters.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        let _gate = self.write_gate.lock();
        self.counters.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Counter>, StoreError> {
        Ok(self.counters.get(key).map(|c| c.value().clone()))
    }

    async fn put(&self, key: &str, counter: Counter) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock();
        self.counters.insert(key.to_string(), counter);
        Ok(())
    }

    async fn acquire(&self, charges: &[Charge], now: DateTime<Utc>) -> Result<Acquired, StoreError> {
        let _gate = self.write_gate.lock();

        let mut counters = Vec::with_capacity(charges.len());
        for charge in charges {
            let mut counter = self.counters.entry(charge.key.clone()).or_insert_with(|| {
                debug!(
                    key = %charge.key,
                    limit = charge.spec.calls(),
                    period = ?charge.spec.period(),
                    "Creating new rate limit counter"
                );
                Counter::new(now, charge.spec.period())
            });
            counter.refresh(now);
            counters.push(counter.value().clone());
        }

        let admitted = charges
            .iter()
            .zip(&counters)
            .all(|(charge, counter)| counter.has_room(charge.spec.calls()));

        if admitted {
            for (charge, counter) in charges.iter().zip(counters.iter_mut()) {
                if let Some(mut stored) = self.counters.get_mut(&charge.key) {
                    stored.try_increment(charge.spec.calls());
                    *counter = stored.value().clone();
                }
            }
        }

        Ok(Acquired { admitted, counters })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
