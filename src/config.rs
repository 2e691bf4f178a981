use serde::Deserialize;
use std::time::Duration;

use crate::{
    error::{GateError, Result},
    policy::{RuleConfig, RulesConfig, DEFAULT_RULE_ID},
    redis::{RedisSettings, ShardConfig},
};

/// Service settings, loaded from an optional YAML file with
/// `TOKENGATE_`-prefixed environment overrides layered on top.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub store: StoreSettings,

    /// Secret for validating bearer tokens during identity extraction.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// YAML file with rate limit rules; built-in defaults when absent.
    #[serde(default)]
    pub rules_file: Option<String>,

    /// Longest-prefix mapping from request path to rule id. Paths that match
    /// nothing fall back to the default rule.
    #[serde(default)]
    pub route_rules: Vec<RouteRule>,

    #[serde(default)]
    pub deny_cache: DenyCacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
    pub prefix: String,
    pub rule_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Shard topology for the redis backend.
    #[serde(default)]
    pub shards: Vec<ShardConfig>,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bucket TTL. Evicted keys recreate as full buckets, the safe default.
    #[serde(default = "default_key_ttl_secs")]
    pub key_ttl_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            shards: Vec::new(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            key_prefix: default_key_prefix(),
            key_ttl_secs: default_key_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DenyCacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_deny_cache_size")]
    pub size: u64,
}

impl Default for DenyCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            size: default_deny_cache_size(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_jwt_secret() -> String {
    "secret".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_key_prefix() -> String {
    crate::store::DEFAULT_KEY_PREFIX.to_string()
}

fn default_key_ttl_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_deny_cache_size() -> u64 {
    10_000
}

impl Settings {
    /// Load settings from the given file (if any) plus environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::with_name("tokengate").required(false)),
        };

        builder = builder.add_source(
            config::Environment::with_prefix("TOKENGATE")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GateError::Config(format!("failed to load settings: {}", e)))
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            connection_timeout: Duration::from_millis(self.store.connection_timeout_ms),
            command_timeout: Duration::from_millis(self.store.command_timeout_ms),
        }
    }
}

/// Built-in rules used when no rules file is configured: 100 requests per
/// second per client with a burst capacity of 100.
pub fn default_rules() -> RulesConfig {
    RulesConfig {
        rules: vec![RuleConfig {
            id: DEFAULT_RULE_ID.to_string(),
            refill_rate_per_second: 100.0,
            capacity: 100,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings: Settings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings.listen_addr, "0.0.0.0:8080");
        assert_eq!(settings.store.backend, StoreBackend::Redis);
        assert_eq!(settings.store.key_prefix, "rate_limit");
        assert_eq!(settings.store.key_ttl_secs, 3600);
        assert!(settings.deny_cache.enabled);
    }

    #[test]
    fn test_settings_from_yaml() {
        let yaml = r#"
listen_addr: "127.0.0.1:9000"
store:
  backend: memory
  command_timeout_ms: 5
route_rules:
  - prefix: /search
    rule_id: search
deny_cache:
  enabled: false
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.listen_addr, "127.0.0.1:9000");
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.store.command_timeout_ms, 5);
        assert_eq!(settings.route_rules[0].rule_id, "search");
        assert!(!settings.deny_cache.enabled);
    }

    #[test]
    fn test_shard_topology_from_yaml() {
        let yaml = r#"
store:
  backend: redis
  shards:
    - primary_url: "redis://shard-0:6379"
      replica_url: "redis://shard-0-replica:6379"
    - primary_url: "redis://shard-1:6379"
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.store.shards.len(), 2);
        assert!(settings.store.shards[0].replica_url.is_some());
        assert!(settings.store.shards[1].replica_url.is_none());
    }

    #[test]
    fn test_default_rules_are_valid() {
        let rules = default_rules();
        assert_eq!(rules.rules.len(), 1);
        assert_eq!(rules.rules[0].id, DEFAULT_RULE_ID);
        assert!(rules.rules[0].refill_rate_per_second > 0.0);
    }
}
