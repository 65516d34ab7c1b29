//! Fixed-window counter.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A count of admitted requests within one fixed window.
///
/// Counters live inside a [`CounterStore`](super::CounterStore). The limiter
/// never deletes them; an expired counter is reset on its next access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    /// Requests admitted in the current window
    pub count: u64,
    /// When the current window started
    pub window_start: DateTime<Utc>,
    /// Window length
    pub period: Duration,
}

impl Counter {
    /// Create an empty counter whose window starts at `now`.
    pub fn new(now: DateTime<Utc>, period: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            period,
        }
    }

    /// When the current window ends.
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.period)
            .ok()
            .and_then(|period| self.window_start.checked_add_signed(period))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether `now` is at or past the end of the window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Start a fresh window at `now` if the current one has ended.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if self.is_expired(now) {
            self.count = 0;
            self.window_start = now;
        }
    }

    /// Whether another request fits under `calls` this window.
    pub fn has_room(&self, calls: u64) -> bool {
        self.count < calls
    }

    /// Count one request if fewer than `calls` were admitted this window.
    ///
    /// Returns `true` if the request was counted. A refused request leaves the
    /// count untouched.
    pub fn try_increment(&mut self, calls: u64) -> bool {
        if self.has_room(calls) {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Remaining quota against `calls`.
    pub fn remaining(&self, calls: u64) -> u64 {
        calls.saturating_sub(self.count)
    }
}
