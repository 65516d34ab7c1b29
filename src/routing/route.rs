//! Route entries and task-name patterns.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// A task-name pattern.
///
/// `"*"` matches everything, `"prefix.*"` matches every name starting with
/// `"prefix."`, anything else must match exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPattern {
    Any,
    Prefix(String),
    Exact(String),
}

impl TaskPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(TollgateError::Routing("empty task pattern".to_string()));
        }
        if pattern == "*" {
            return Ok(TaskPattern::Any);
        }

        let (head, wildcard) = match pattern.strip_suffix('*') {
            Some(head) => (head, true),
            None => (pattern, false),
        };
        if head.contains('*') {
            return Err(TollgateError::Routing(format!(
                "pattern '{}' may only end in a wildcard",
                pattern
            )));
        }

        Ok(if wildcard {
            TaskPattern::Prefix(head.to_string())
        } else {
            TaskPattern::Exact(head.to_string())
        })
    }

    pub fn matches(&self, task_name: &str) -> bool {
        match self {
            TaskPattern::Any => true,
            TaskPattern::Prefix(prefix) => task_name.starts_with(prefix.as_str()),
            TaskPattern::Exact(name) => task_name == name,
        }
    }

    pub fn is_catch_all(&self) -> bool {
        matches!(self, TaskPattern::Any)
    }
}

impl fmt::Display for TaskPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPattern::Any => write!(f, "*"),
            TaskPattern::Prefix(prefix) => write!(f, "{}*", prefix),
            TaskPattern::Exact(name) => write!(f, "{}", name),
        }
    }
}

/// Where tasks matching a pattern go, and how long they may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub pattern: TaskPattern,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    /// Hard limit: the worker is killed past this
    pub time_limit: Duration,
    /// Soft limit: the task is warned past this; always below `time_limit`
    pub soft_time_limit: Duration,
}

impl RouteEntry {
    /// Check the entry's own invariants.
    pub fn validate(&self) -> Result<()> {
        if self.queue.trim().is_empty() {
            return Err(TollgateError::Routing(format!(
                "route '{}' has an empty queue name",
                self.pattern
            )));
        }
        if self.soft_time_limit >= self.time_limit {
            return Err(TollgateError::Routing(format!(
                "route '{}': soft time limit {:?} must be below time limit {:?}",
                self.pattern, self.soft_time_limit, self.time_limit
            )));
        }
        Ok(())
    }

    /// Execution deadlines the producer attaches to a dispatched unit.
    pub fn deadlines(&self) -> ExecutionDeadlines {
        ExecutionDeadlines {
            soft: self.soft_time_limit,
            hard: self.time_limit,
        }
    }
}

/// Time budgets enforced by the broker's workers, not by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionDeadlines {
    pub soft: Duration,
    pub hard: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        let prefix = TaskPattern::parse("core.tasks.*").unwrap();
        assert!(prefix.matches("core.tasks.sync"));
        assert!(!prefix.matches("core.other.sync"));
        assert!(!prefix.matches("core.tasks"));

        let exact = TaskPattern::parse("mlops.tasks.train").unwrap();
        assert!(exact.matches("mlops.tasks.train"));
        assert!(!exact.matches("mlops.tasks.train_v2"));

        assert!(TaskPattern::parse("*").unwrap().matches("anything.at.all"));
    }

    #[test]
    fn test_pattern_rejects_inner_wildcards() {
        assert!(TaskPattern::parse("core.*.sync").is_err());
        assert!(TaskPattern::parse("").is_err());
        assert_eq!(TaskPattern::parse("ai.*").unwrap().to_string(), "ai.*");
    }

    #[test]
    fn test_soft_limit_must_be_below_hard_limit() {
        let mut entry = RouteEntry {
            pattern: TaskPattern::Any,
            queue: "default".to_string(),
            exchange: "tasks".to_string(),
            routing_key: "default".to_string(),
            time_limit: Duration::from_secs(60),
            soft_time_limit: Duration::from_secs(60),
        };
        assert!(entry.validate().is_err());

        entry.soft_time_limit = Duration::from_secs(50);
        assert!(entry.validate().is_ok());
        assert_eq!(entry.deadlines().soft, Duration::from_secs(50));
    }
}
