//! Admission decisions and their HTTP rendering.

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::{Response, StatusCode};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// How a decision was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The counter store answered and the limit was applied.
    Enforced,
    /// The counter store failed; the request was admitted anyway.
    FailedOpen(String),
    /// Rate limiting is disabled or no limit applied to the call.
    Bypassed,
}

/// The result of checking one request against one or more limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    /// Calls allowed per window by the binding limit
    pub limit: u64,
    /// Calls left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// Counter scope of the binding limit
    pub scope: String,
    pub outcome: Outcome,
}

impl Decision {
    /// Whether the counter store could not be consulted.
    pub fn failed_open(&self) -> bool {
        matches!(self.outcome, Outcome::FailedOpen(_))
    }

    /// Whole seconds to wait before retrying, never less than one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }

    /// Advisory headers describing the binding limit.
    ///
    /// Bypassed decisions carry no limit and render no headers.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if self.outcome == Outcome::Bypassed {
            return headers;
        }

        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(
            X_RATELIMIT_RESET,
            HeaderValue::from(self.reset_at.timestamp().max(0) as u64),
        );
        headers
    }

    /// Pick the decision that governs when two limits applied to one call.
    ///
    /// A rejection beats an admission. Between two rejections the later reset
    /// wins; between two admissions the one with less quota left wins.
    pub fn stricter(self, other: Decision) -> Decision {
        match (self.admitted, other.admitted) {
            (true, false) => other,
            (false, true) => self,
            (false, false) => {
                if other.reset_at > self.reset_at {
                    other
                } else {
                    self
                }
            }
            (true, true) => {
                if self.outcome == Outcome::Bypassed
                    || (other.outcome != Outcome::Bypassed
                        && (other.remaining, other.limit) < (self.remaining, self.limit))
                {
                    other
                } else {
                    self
                }
            }
        }
    }
}

/// A refused call: what the caller should send back instead of the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub decision: Decision,
    pub retry_after_secs: u64,
}

impl Rejection {
    pub fn new(decision: Decision, now: DateTime<Utc>) -> Self {
        let retry_after_secs = decision.retry_after_secs(now);
        Self {
            decision,
            retry_after_secs,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }

    /// Rate limit headers plus `Retry-After`.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = self.decision.headers();
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        headers
    }

    /// Render a `429 Too Many Requests` response.
    pub fn to_response(&self) -> Response<String> {
        let mut response = Response::new(format!(
            "Rate limit exceeded: {} per window, retry in {} seconds",
            self.decision.limit, self.retry_after_secs
        ));
        *response.status_mut() = self.status();
        *response.headers_mut() = self.headers();
        response
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rate limit {} exceeded, retry after {}s",
            self.decision.scope, self.retry_after_secs
        )
    }
}

impl std::error::Error for Rejection {}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_704_067_200 + secs, 0).unwrap()
    }

    fn decision(admitted: bool, limit: u64, remaining: u64, reset: i64) -> Decision {
        Decision {
            admitted,
            limit,
            remaining,
            reset_at: at(reset),
            scope: format!("{}/60s", limit),
            outcome: Outcome::Enforced,
        }
    }

    #[test]
    fn test_headers_expose_limit_state() {
        let headers = decision(true, 60, 59, 60).headers();

        assert_eq!(headers[&X_RATELIMIT_LIMIT], "60");
        assert_eq!(headers[&X_RATELIMIT_REMAINING], "59");
        assert_eq!(headers[&X_RATELIMIT_RESET], at(60).timestamp().to_string().as_str());
    }

    #[test]
    fn test_bypassed_has_no_headers() {
        let mut d = decision(true, 60, 60, 60);
        d.outcome = Outcome::Bypassed;
        assert!(d.headers().is_empty());
    }

    #[test]
    fn test_rejection_response() {
        let rejection = Rejection::new(decision(false, 5, 0, 45), at(0));
        assert_eq!(rejection.retry_after_secs, 45);

        let response = rejection.to_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "45");
        assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], "0");
    }

    #[test]
    fn test_retry_after_rounds_up_and_floors_at_one() {
        let mut d = decision(false, 5, 0, 0);
        assert_eq!(d.retry_after_secs(at(0)), 1);

        d.reset_at = at(10) + chrono::Duration::milliseconds(200);
        assert_eq!(d.retry_after_secs(at(0)), 11);
    }

    #[test]
    fn test_stricter_prefers_rejection_then_least_remaining() {
        let loose = decision(true, 60, 54, 60);
        let strict = decision(true, 5, 0, 60);
        assert_eq!(loose.clone().stricter(strict.clone()).limit, 5);
        assert_eq!(strict.clone().stricter(loose.clone()).limit, 5);

        let rejected = decision(false, 5, 0, 30);
        assert!(!loose.clone().stricter(rejected.clone()).admitted);

        let later = decision(false, 100, 0, 3600);
        assert_eq!(rejected.stricter(later).reset_at, at(3600));
    }
}
