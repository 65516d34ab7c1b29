//! Task routing table configuration and classification.
//!
//! The table is an ordered list of routes. Classification returns the first
//! route whose pattern matches the task name, and the last route always
//! matches everything, so every task name has a destination.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::route::{ExecutionDeadlines, RouteEntry, TaskPattern};
use crate::error::{Result, TollgateError};

const DEFAULT_EXCHANGE: &str = "tasks";
const DEFAULT_QUEUE: &str = "default";
/// 30 minutes
const DEFAULT_TIME_LIMIT_SECS: u64 = 30 * 60;
/// 25 minutes
const DEFAULT_SOFT_TIME_LIMIT_SECS: u64 = 25 * 60;

/// Routing table as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Queue for tasks no route matches. Appended as the `"*"` route when no
    /// explicit catch-all route is listed.
    #[serde(default)]
    pub default_queue: Option<String>,

    /// Exchange used by routes that do not name one
    #[serde(default = "default_exchange")]
    pub default_exchange: String,

    /// Routing key for the default queue; defaults to the queue name
    #[serde(default)]
    pub default_routing_key: Option<String>,

    #[serde(default = "default_time_limit")]
    pub time_limit_secs: u64,

    #[serde(default = "default_soft_time_limit")]
    pub soft_time_limit_secs: u64,

    /// Routes in priority order
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

/// One route as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub pattern: String,
    pub queue: String,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
    #[serde(default)]
    pub soft_time_limit_secs: Option<u64>,
}

impl RouteRule {
    pub fn new(pattern: &str, queue: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            queue: queue.to_string(),
            exchange: None,
            routing_key: None,
            time_limit_secs: None,
            soft_time_limit_secs: None,
        }
    }
}

fn default_exchange() -> String {
    DEFAULT_EXCHANGE.to_string()
}

fn default_time_limit() -> u64 {
    DEFAULT_TIME_LIMIT_SECS
}

fn default_soft_time_limit() -> u64 {
    DEFAULT_SOFT_TIME_LIMIT_SECS
}

impl Default for RoutingConfig {
    /// The stock deployment: one queue per subsystem plus a default queue.
    fn default() -> Self {
        Self {
            default_queue: Some(DEFAULT_QUEUE.to_string()),
            default_exchange: default_exchange(),
            default_routing_key: Some(DEFAULT_QUEUE.to_string()),
            time_limit_secs: DEFAULT_TIME_LIMIT_SECS,
            soft_time_limit_secs: DEFAULT_SOFT_TIME_LIMIT_SECS,
            routes: vec![
                RouteRule::new("core.tasks.*", "default"),
                RouteRule::new("mlops.tasks.*", "mlops"),
                RouteRule::new("generative_ai.tasks.*", "ai"),
                RouteRule::new("security_center.tasks.*", "security"),
            ],
        }
    }
}

impl RoutingConfig {
    /// Load a routing configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse routing config: {}", e)))
    }

    /// Validate and build the table.
    pub fn build(&self) -> Result<RoutingTable> {
        let mut entries = Vec::with_capacity(self.routes.len() + 1);

        for rule in &self.routes {
            let routing_key = rule.routing_key.clone().unwrap_or_else(|| rule.queue.clone());
            entries.push(RouteEntry {
                pattern: TaskPattern::parse(&rule.pattern)?,
                queue: rule.queue.clone(),
                exchange: rule.exchange.clone().unwrap_or_else(|| self.default_exchange.clone()),
                routing_key,
                time_limit: Duration::from_secs(rule.time_limit_secs.unwrap_or(self.time_limit_secs)),
                soft_time_limit: Duration::from_secs(
                    rule.soft_time_limit_secs.unwrap_or(self.soft_time_limit_secs),
                ),
            });
        }

        let has_catch_all = entries.iter().any(|e| e.pattern.is_catch_all());
        if !has_catch_all {
            let queue = self.default_queue.clone().ok_or_else(|| {
                TollgateError::Routing(
                    "no default route: add a '*' route or set default_queue".to_string(),
                )
            })?;
            entries.push(RouteEntry {
                pattern: TaskPattern::Any,
                routing_key: self.default_routing_key.clone().unwrap_or_else(|| queue.clone()),
                queue,
                exchange: self.default_exchange.clone(),
                time_limit: Duration::from_secs(self.time_limit_secs),
                soft_time_limit: Duration::from_secs(self.soft_time_limit_secs),
            });
        }

        RoutingTable::new(entries)
    }
}

/// A validated, ordered routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
}

/// A task name together with where it goes and its deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch<'a> {
    pub task_name: String,
    pub route: &'a RouteEntry,
    pub deadlines: ExecutionDeadlines,
}

impl RoutingTable {
    /// Build a table from ordered entries.
    ///
    /// The last entry must be the catch-all and no other entry may be one,
    /// since routes after a catch-all could never match.
    pub fn new(entries: Vec<RouteEntry>) -> Result<Self> {
        for entry in &entries {
            entry.validate()?;
        }

        match entries.iter().position(|e| e.pattern.is_catch_all()) {
            None => {
                return Err(TollgateError::Routing(
                    "routing table has no default '*' route".to_string(),
                ))
            }
            Some(pos) if pos != entries.len() - 1 => {
                return Err(TollgateError::Routing(format!(
                    "default '*' route must be last, found at position {} of {}",
                    pos + 1,
                    entries.len()
                )))
            }
            Some(_) => {}
        }

        debug!(routes = entries.len(), "Routing table built");
        Ok(Self { entries })
    }

    /// Load a routing table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading routing table");

        let contents = std::fs::read_to_string(path)?;
        RoutingConfig::from_yaml(&contents)?.build()
    }

    /// Routes in priority order; the last one is the default.
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// The catch-all route.
    pub fn default_route(&self) -> &RouteEntry {
        // Non-empty and catch-all last, checked in `new`
        &self.entries[self.entries.len() - 1]
    }

    /// Find the route for a task name.
    pub fn classify(&self, task_name: &str) -> &RouteEntry {
        self.entries
            .iter()
            .find(|e| e.pattern.matches(task_name))
            .unwrap_or_else(|| self.default_route())
    }

    /// Classify a task and collect what the producer attaches to it.
    pub fn prepare(&self, task_name: &str) -> Dispatch<'_> {
        let route = self.classify(task_name);
        debug!(
            task = %task_name,
            queue = %route.queue,
            routing_key = %route.routing_key,
            "Classified task"
        );
        Dispatch {
            task_name: task_name.to_string(),
            route,
            deadlines: route.deadlines(),
        }
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        RoutingConfig::default().build().unwrap_or_else(|_| Self {
            entries: vec![RouteEntry {
                pattern: TaskPattern::Any,
                queue: DEFAULT_QUEUE.to_string(),
                exchange: DEFAULT_EXCHANGE.to_string(),
                routing_key: DEFAULT_QUEUE.to_string(),
                time_limit: Duration::from_secs(DEFAULT_TIME_LIMIT_SECS),
                soft_time_limit: Duration::from_secs(DEFAULT_SOFT_TIME_LIMIT_SECS),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_priority() {
        let yaml = r#"
default_queue: default
routes:
  - pattern: "core.tasks.*"
    queue: A
"#;
        let table = RoutingConfig::from_yaml(yaml).unwrap().build().unwrap();

        assert_eq!(table.classify("core.tasks.sync").queue, "A");
        assert_eq!(table.classify("other.job").queue, "default");
    }

    #[test]
    fn test_first_match_wins() {
        let yaml = r#"
routes:
  - pattern: "mlops.tasks.train"
    queue: gpu
  - pattern: "mlops.tasks.*"
    queue: mlops
  - pattern: "*"
    queue: default
"#;
        let table = RoutingConfig::from_yaml(yaml).unwrap().build().unwrap();

        assert_eq!(table.classify("mlops.tasks.train").queue, "gpu");
        assert_eq!(table.classify("mlops.tasks.evaluate").queue, "mlops");
        assert_eq!(table.entries().len(), 3);
    }

    #[test]
    fn test_missing_default_is_an_error() {
        let yaml = r#"
routes:
  - pattern: "core.tasks.*"
    queue: default
"#;
        let err = RoutingConfig::from_yaml(yaml).unwrap().build().unwrap_err();
        assert!(matches!(err, TollgateError::Routing(_)));
    }

    #[test]
    fn test_catch_all_must_be_last() {
        let yaml = r#"
routes:
  - pattern: "*"
    queue: default
  - pattern: "core.tasks.*"
    queue: core
"#;
        assert!(RoutingConfig::from_yaml(yaml).unwrap().build().is_err());
    }

    #[test]
    fn test_route_overrides_and_inherited_defaults() {
        let yaml = r#"
default_queue: default
default_exchange: jobs
time_limit_secs: 600
soft_time_limit_secs: 540
routes:
  - pattern: "generative_ai.tasks.*"
    queue: ai
    routing_key: ai.high
    time_limit_secs: 3600
    soft_time_limit_secs: 3300
"#;
        let table = RoutingConfig::from_yaml(yaml).unwrap().build().unwrap();

        let dispatch = table.prepare("generative_ai.tasks.summarize");
        assert_eq!(dispatch.route.exchange, "jobs");
        assert_eq!(dispatch.route.routing_key, "ai.high");
        assert_eq!(dispatch.deadlines.hard, Duration::from_secs(3600));
        assert_eq!(dispatch.deadlines.soft, Duration::from_secs(3300));

        let fallback = table.prepare("unknown.task");
        assert_eq!(fallback.route.queue, "default");
        assert_eq!(fallback.route.routing_key, "default");
        assert_eq!(fallback.deadlines.hard, Duration::from_secs(600));
    }

    #[test]
    fn test_invalid_soft_limit_rejected() {
        let yaml = r#"
default_queue: default
routes:
  - pattern: "core.tasks.*"
    queue: default
    time_limit_secs: 60
    soft_time_limit_secs: 120
"#;
        assert!(RoutingConfig::from_yaml(yaml).unwrap().build().is_err());
    }

    #[test]
    fn test_stock_table() {
        let table = RoutingTable::default();
        assert_eq!(table, RoutingConfig::default().build().unwrap());

        assert_eq!(table.classify("core.tasks.send_notification").queue, "default");
        assert_eq!(table.classify("mlops.tasks.retrain").queue, "mlops");
        assert_eq!(table.classify("generative_ai.tasks.rag").queue, "ai");
        assert_eq!(table.classify("security_center.tasks.scan").queue, "security");
        assert_eq!(table.classify("reports.generate").queue, "default");

        let route = table.default_route();
        assert_eq!(route.exchange, "tasks");
        assert_eq!(route.time_limit, Duration::from_secs(1800));
        assert_eq!(route.soft_time_limit, Duration::from_secs(1500));
    }
}
