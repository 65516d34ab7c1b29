//! Limit specifications: how many calls are allowed per period.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Time unit accepted in the `"<calls>/<unit>"` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        match word {
            "s" | "sec" | "second" | "seconds" => Some(TimeUnit::Second),
            "m" | "min" | "minute" | "minutes" => Some(TimeUnit::Minute),
            "h" | "hour" | "hours" => Some(TimeUnit::Hour),
            "d" | "day" | "days" => Some(TimeUnit::Day),
            _ => None,
        }
    }
}

/// A budget of `calls` admitted requests per `period`.
///
/// Construction validates both values, so a `LimitSpec` in hand is always
/// usable at request time. Each spec maps to its own counter scope: two
/// different specs applied to the same caller never share a count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "LimitSpecRepr", into = "LimitSpecRepr")]
pub struct LimitSpec {
    calls: u64,
    period: Duration,
    /// Optional name separating counters of operations with equal budgets
    scope: Option<String>,
}

impl LimitSpec {
    /// Create a new limit, rejecting zero calls, a zero period or a period
    /// that is not a whole number of milliseconds.
    pub fn new(calls: u64, period: Duration) -> Result<Self> {
        if calls == 0 {
            return Err(TollgateError::InvalidLimit(
                "calls must be greater than zero".to_string(),
            ));
        }
        if period.is_zero() {
            return Err(TollgateError::InvalidLimit(
                "period must be greater than zero".to_string(),
            ));
        }
        if period.subsec_nanos() % 1_000_000 != 0 {
            return Err(TollgateError::InvalidLimit(format!(
                "period {:?} is finer than one millisecond",
                period
            )));
        }
        Ok(Self {
            calls,
            period,
            scope: None,
        })
    }

    /// Create a limit from a period given in whole seconds.
    pub fn from_secs(calls: u64, period_secs: u64) -> Result<Self> {
        Self::new(calls, Duration::from_secs(period_secs))
    }

    /// `calls` per minute, the unit of the process-wide default.
    pub fn per_minute(calls: u64) -> Result<Self> {
        Self::new(calls, TimeUnit::Minute.duration())
    }

    /// `calls` per hour.
    pub fn per_hour(calls: u64) -> Result<Self> {
        Self::new(calls, TimeUnit::Hour.duration())
    }

    /// Attach a scope name so this budget keeps a counter of its own even
    /// when another operation uses the same numbers.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        self.scope = if scope.is_empty() { None } else { Some(scope) };
        self
    }

    /// Parse the `"<calls>/<unit>"` notation, e.g. `"60/minute"`,
    /// `"10/60seconds"` or `"1000/hour"`.
    pub fn parse(notation: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            TollgateError::InvalidLimit(format!("'{}': {}", notation, reason))
        };

        let (calls, per) = notation
            .split_once('/')
            .ok_or_else(|| invalid("expected '<calls>/<unit>'"))?;

        let calls: u64 = calls
            .trim()
            .parse()
            .map_err(|_| invalid("calls is not a number"))?;

        let per = per.trim().to_ascii_lowercase();
        let digits = per.chars().take_while(|c| c.is_ascii_digit()).count();
        let (multiplier, word) = per.split_at(digits);
        let multiplier: u32 = if multiplier.is_empty() {
            1
        } else {
            multiplier
                .parse()
                .map_err(|_| invalid("period multiplier is not a number"))?
        };

        let unit = TimeUnit::from_word(word.trim()).ok_or_else(|| invalid("unknown time unit"))?;

        Self::new(calls, unit.duration() * multiplier)
    }

    /// Maximum admitted calls per window.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// The scope name, if one was attached.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Identifier of the counter scope this spec owns.
    pub fn scope_id(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{}:{}", scope, self.budget()),
            None => self.budget(),
        }
    }

    /// Whether this spec admits fewer calls per unit of time than `other`.
    pub fn is_stricter_than(&self, other: &LimitSpec) -> bool {
        // calls/period < other.calls/other.period, cross-multiplied
        let lhs = self.calls as u128 * other.period.as_millis();
        let rhs = other.calls as u128 * self.period.as_millis();
        lhs < rhs
    }

    fn budget(&self) -> String {
        if self.period.subsec_nanos() == 0 {
            format!("{}/{}s", self.calls, self.period.as_secs())
        } else {
            format!("{}/{}ms", self.calls, self.period.as_millis())
        }
    }
}

impl fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scope_id())
    }
}

impl FromStr for LimitSpec {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Serialized form used in configuration files.
///
/// Whole-second periods are written as `period_secs`, anything finer as
/// `period_ms`. Exactly one of the two must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LimitSpecRepr {
    calls: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    period_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    period_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

impl TryFrom<LimitSpecRepr> for LimitSpec {
    type Error = TollgateError;

    fn try_from(repr: LimitSpecRepr) -> Result<Self> {
        let period = match (repr.period_secs, repr.period_ms) {
            (Some(secs), None) => Duration::from_secs(secs),
            (None, Some(millis)) => Duration::from_millis(millis),
            _ => {
                return Err(TollgateError::InvalidLimit(
                    "exactly one of period_secs and period_ms is required".to_string(),
                ))
            }
        };

        let spec = LimitSpec::new(repr.calls, period)?;
        Ok(match repr.scope {
            Some(scope) => spec.with_scope(scope),
            None => spec,
        })
    }
}

impl From<LimitSpec> for LimitSpecRepr {
    fn from(spec: LimitSpec) -> Self {
        let (period_secs, period_ms) = if spec.period.subsec_nanos() == 0 {
            (Some(spec.period.as_secs()), None)
        } else {
            (None, Some(spec.period.as_millis() as u64))
        };

        Self {
            calls: spec.calls,
            period_secs,
            period_ms,
            scope: spec.scope,
        }
    }
}
