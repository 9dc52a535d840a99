//! # Broker Configuration
//!
//! Environment-driven configuration. Backend selection is controlled by a handful of
//! variables:
//!
//! | Variable                 | Field                    | Meaning                                    |
//! |--------------------------|--------------------------|--------------------------------------------|
//! | `NAME_PREFIX`            | `name_prefix`            | prefix for generated backend resource names |
//! | `AWS_REGION`             | `aws_region`             | region for the managed cache backends      |
//! | `USE_KUBERNETES`         | `use_kubernetes`         | enable the container backends              |
//! | `TEST`                   | `test`                   | substitute in-memory backend clients       |
//! | `USE_LOCAL_KUBE_CONTEXT` | `use_local_kube_context` | allow `~/.kube/config` outside a cluster   |
//! | `DATABASE_URL`           | `database_url`           | PostgreSQL storage                         |
//!
//! Timing knobs (`INSTANCE_CACHE_TTL_SECONDS`, `POLL_INTERVAL_MS`, `POLL_MAX_ATTEMPTS`)
//! bound the provider read cache and the backend wait loops.

use config::{Config, Environment};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        ConfigurationError::Load(error.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub name_prefix: String,
    pub aws_region: Option<String>,
    pub use_kubernetes: bool,
    pub test: bool,
    pub use_local_kube_context: bool,
    pub database_url: Option<String>,
    pub instance_cache_ttl_seconds: u64,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name_prefix: "cache".to_string(),
            aws_region: None,
            use_kubernetes: false,
            test: false,
            use_local_kube_context: false,
            database_url: None,
            instance_cache_ttl_seconds: 5,
            poll_interval_ms: 15_000,
            poll_max_attempts: 40,
        }
    }
}

impl BrokerConfig {
    /// Load from the process environment
    pub fn from_env() -> ConfigResult<Self> {
        Self::load(Environment::default().try_parsing(true))
    }

    /// Load from an explicit variable map, as if it were the environment
    pub fn from_map(vars: HashMap<String, String>) -> ConfigResult<Self> {
        Self::load(Environment::default().try_parsing(true).source(Some(vars)))
    }

    fn load(environment: Environment) -> ConfigResult<Self> {
        let defaults = Self::default();
        let config = Config::builder()
            .set_default("name_prefix", defaults.name_prefix)?
            .set_default("use_kubernetes", defaults.use_kubernetes)?
            .set_default("test", defaults.test)?
            .set_default("use_local_kube_context", defaults.use_local_kube_context)?
            .set_default(
                "instance_cache_ttl_seconds",
                defaults.instance_cache_ttl_seconds,
            )?
            .set_default("poll_interval_ms", defaults.poll_interval_ms)?
            .set_default("poll_max_attempts", defaults.poll_max_attempts)?
            .add_source(environment)
            .build()?;

        let loaded: BrokerConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.name_prefix.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "NAME_PREFIX must not be empty".to_string(),
            ));
        }
        if self.poll_max_attempts == 0 {
            return Err(ConfigurationError::Invalid(
                "POLL_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn instance_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.instance_cache_ttl_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Region for the managed cache backends, required outside test mode
    pub fn require_aws_region(&self) -> ConfigResult<&str> {
        match self.aws_region.as_deref() {
            Some(region) if !region.is_empty() => Ok(region),
            _ => Err(ConfigurationError::Invalid(
                "Unable to find AWS_REGION environment variable.".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = BrokerConfig::from_map(HashMap::new()).unwrap();
        assert_eq!(config.name_prefix, "cache");
        assert!(!config.use_kubernetes);
        assert!(!config.test);
        assert_eq!(config.instance_cache_ttl(), Duration::from_secs(5));
        assert!(config.require_aws_region().is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let config = BrokerConfig::from_map(vars(&[
            ("NAME_PREFIX", "akk"),
            ("AWS_REGION", "us-west-2"),
            ("USE_KUBERNETES", "true"),
            ("TEST", "true"),
            ("POLL_INTERVAL_MS", "10"),
        ]))
        .unwrap();
        assert_eq!(config.name_prefix, "akk");
        assert_eq!(config.require_aws_region().unwrap(), "us-west-2");
        assert!(config.use_kubernetes);
        assert!(config.test);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_rejects_zero_poll_attempts() {
        let result = BrokerConfig::from_map(vars(&[("POLL_MAX_ATTEMPTS", "0")]));
        assert!(matches!(result, Err(ConfigurationError::Invalid(_))));
    }
}
