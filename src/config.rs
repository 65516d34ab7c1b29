//! Configuration management for Tollgate.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! environment variables prefixed with `TOLLGATE__`, using `__` as the
//! nesting separator (e.g. `TOLLGATE__RATE_LIMITING__DEFAULT_PER_MINUTE=120`).

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::error::Result;
use crate::ratelimit::LimitSpec;
use crate::routing::RoutingConfig;

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Caller identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Task routing table
    #[serde(default)]
    pub routing: RoutingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Counter storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Turn admission control off entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Process-wide default: calls per minute per caller
    #[serde(default = "default_per_minute")]
    pub default_per_minute: u64,

    /// Optional second default: calls per hour per caller
    #[serde(default)]
    pub default_per_hour: Option<u64>,

    /// Counter storage backend
    #[serde(default)]
    pub storage: StorageBackend,

    /// Connection URL, required when `storage` is `redis`
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Upper bound on one counter store round-trip in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Prefix of every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_per_minute: default_per_minute(),
            default_per_hour: None,
            storage: StorageBackend::default(),
            redis_url: None,
            store_timeout_ms: default_store_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_per_minute() -> u64 {
    crate::ratelimit::DEFAULT_CALLS_PER_MINUTE
}

fn default_store_timeout_ms() -> u64 {
    crate::ratelimit::DEFAULT_STORE_TIMEOUT.as_millis() as u64
}

fn default_key_prefix() -> String {
    crate::ratelimit::DEFAULT_KEY_PREFIX.to_string()
}

impl RateLimitingConfig {
    /// The process-wide default limits. Zero values are rejected here.
    pub fn default_limits(&self) -> Result<Vec<LimitSpec>> {
        let mut limits = vec![LimitSpec::per_minute(self.default_per_minute)?];
        if let Some(per_hour) = self.default_per_hour {
            limits.push(LimitSpec::per_hour(per_hour)?);
        }
        Ok(limits)
    }
}

/// Caller identity configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Believe `X-Forwarded-For` when it comes from a trusted proxy
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Proxies allowed to set `X-Forwarded-For`; loopback when empty
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl TollgateConfig {
    /// Load configuration from an optional file plus `TOLLGATE__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, ignoring the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| crate::error::TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would only fail later at request time.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.default_limits()?;
        if self.rate_limiting.store_timeout_ms == 0 {
            return Err(crate::error::TollgateError::Config(
                "rate_limiting.store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.storage == StorageBackend::Redis && self.rate_limiting.redis_url.is_none() {
            return Err(crate::error::TollgateError::Config(
                "rate_limiting.redis_url is required when storage is 'redis'".to_string(),
            ));
        }
        self.routing.build()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.grpc_addr, "127.0.0.1:8081".parse().unwrap());
        assert!(config.rate_limiting.enabled);
        assert_eq!(config.rate_limiting.storage, StorageBackend::Memory);
        assert_eq!(
            config.rate_limiting.default_limits().unwrap(),
            vec![LimitSpec::new(60, Duration::from_secs(60)).unwrap()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  grpc_addr: "0.0.0.0:9000"
rate_limiting:
  default_per_minute: 120
  default_per_hour: 1000
  storage: redis
  redis_url: "redis://cache:6379/0"
identity:
  trust_forwarded_for: true
  trusted_proxies: ["10.0.0.2"]
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.grpc_addr.port(), 9000);
        assert_eq!(config.rate_limiting.storage, StorageBackend::Redis);
        assert_eq!(config.rate_limiting.default_limits().unwrap().len(), 2);
        assert!(config.identity.trust_forwarded_for);
        assert_eq!(config.identity.trusted_proxies, vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
        // Routing falls back to the stock table
        assert_eq!(config.routing, RoutingConfig::default());
    }

    #[test]
    fn test_redis_requires_url() {
        let yaml = r#"
rate_limiting:
  storage: redis
"#;
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_default_rejected() {
        let yaml = r#"
rate_limiting:
  default_per_minute: 0
"#;
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_store_timeout_rejected() {
        let yaml = r#"
rate_limiting:
  store_timeout_ms: 0
"#;
        let err = TollgateConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("store_timeout_ms"));
    }

    #[test]
    fn test_load_without_file() {
        let config = TollgateConfig::load(None).unwrap();
        assert!(config.rate_limiting.enabled);
    }
}
