//! Configuration surface for the resilience layer.
//!
//! The host loads one [`ResilienceConfig`] at startup and feeds it to
//! explicitly constructed components; nothing here is read lazily at
//! check time.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::breaker::CircuitBreakerConfig;
use crate::error::{Error, Result};
use crate::ratelimit::RateLimitRule;
use crate::storage::RedisConfig;

/// Top-level configuration: rate limit settings plus named breakers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResilienceConfig {
    /// Rate limiting section
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Named circuit breaker policies
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerConfig>,
}

/// Rate limiting section: storage selection, key prefix, and rules.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Prefix for derived storage keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageSettings,

    /// Named rules
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            storage: StorageSettings::default(),
            rules: Vec::new(),
        }
    }
}

fn default_key_prefix() -> String {
    "rl".to_string()
}

/// Which storage backend to construct.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageSettings {
    /// In-process maps; single-process deployments and tests.
    #[default]
    Memory,
    /// Shared Redis deployment.
    Redis(RedisConfig),
}

impl ResilienceConfig {
    /// Load and validate configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading resilience configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: ResilienceConfig =
            serde_yaml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        info!(
            rules = config.rate_limit.rules.len(),
            breakers = config.circuit_breakers.len(),
            "Loaded resilience configuration"
        );
        Ok(config)
    }

    /// Check every rule and breaker config, including name uniqueness.
    pub fn validate(&self) -> Result<()> {
        let mut rule_names = std::collections::HashSet::new();
        for rule in &self.rate_limit.rules {
            rule.validate()?;
            if !rule_names.insert(rule.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate rate limit rule name '{}'",
                    rule.name
                )));
            }
        }
        let mut breaker_names = std::collections::HashSet::new();
        for breaker in &self.circuit_breakers {
            breaker.validate()?;
            if !breaker_names.insert(breaker.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate circuit breaker name '{}'",
                    breaker.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Algorithm, Scope};

    const FULL_CONFIG: &str = r#"
rate_limit:
  key_prefix: "svc"
  storage:
    type: redis
    url: redis://127.0.0.1:6379
    key_prefix: "svc:rl:"
  rules:
    - name: api_general
      requests: 100
      window_seconds: 60
      algorithm: sliding_window
      scope: per_ip
    - name: generation
      requests: 5
      window_seconds: 60
      algorithm: token_bucket
      scope: per_user
      burst_multiplier: 2.0
circuit_breakers:
  - name: payments
    failure_threshold: 3
    recovery_timeout_seconds: 30.0
    success_threshold: 2
    call_timeout_seconds: 10.0
  - name: search
"#;

    #[test]
    fn parses_full_config() {
        let config = ResilienceConfig::from_yaml(FULL_CONFIG).unwrap();
        assert_eq!(config.rate_limit.key_prefix, "svc");
        assert_eq!(config.rate_limit.rules.len(), 2);
        assert_eq!(config.circuit_breakers.len(), 2);

        let generation = &config.rate_limit.rules[1];
        assert_eq!(generation.algorithm, Algorithm::TokenBucket);
        assert_eq!(generation.scope, Scope::PerUser);
        assert_eq!(generation.burst_multiplier, 2.0);

        match &config.rate_limit.storage {
            StorageSettings::Redis(redis) => {
                assert_eq!(redis.url, "redis://127.0.0.1:6379");
                assert_eq!(redis.key_prefix, "svc:rl:");
            }
            StorageSettings::Memory => panic!("expected redis storage"),
        }

        // The second breaker relies entirely on defaults.
        assert_eq!(config.circuit_breakers[1].failure_threshold, 5);
    }

    #[test]
    fn empty_config_defaults_to_memory_storage() {
        let config = ResilienceConfig::from_yaml("{}").unwrap();
        assert_eq!(config.rate_limit.key_prefix, "rl");
        assert!(matches!(
            config.rate_limit.storage,
            StorageSettings::Memory
        ));
        assert!(config.rate_limit.rules.is_empty());
    }

    #[test]
    fn rejects_invalid_rule() {
        let yaml = r#"
rate_limit:
  rules:
    - name: broken
      requests: 0
      window_seconds: 60
      algorithm: fixed_window
      scope: global
"#;
        let err = ResilienceConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn rejects_duplicate_rule_names() {
        let yaml = r#"
rate_limit:
  rules:
    - name: dup
      requests: 1
      window_seconds: 60
      algorithm: fixed_window
      scope: global
    - name: dup
      requests: 2
      window_seconds: 60
      algorithm: fixed_window
      scope: global
"#;
        let err = ResilienceConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn rejects_invalid_breaker() {
        let yaml = r#"
circuit_breakers:
  - name: bad
    failure_threshold: 0
"#;
        assert!(ResilienceConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = ResilienceConfig::from_yaml("rate_limit: [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
