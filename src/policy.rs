use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{GateError, Result};

/// Rule applied when a request maps to no more specific rule.
pub const DEFAULT_RULE_ID: &str = "default";

/// A concrete rate-limit policy for one rule.
///
/// Immutable once resolved for a request. Each (identity, rule) pair owns an
/// independent bucket, so several policies can apply to the same client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub rule_id: String,
    pub refill_rate_per_second: f64,
    pub capacity: u32,
}

/// On-disk rule definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub refill_rate_per_second: f64,
    pub capacity: u32,
}

/// Load rule definitions from a YAML string
pub fn load_rules_from_yaml(yaml: &str) -> Result<RulesConfig> {
    serde_yaml::from_str(yaml)
        .map_err(|e| GateError::Config(format!("failed to parse rules YAML: {}", e)))
}

/// Load rule definitions from a YAML file
pub fn load_rules_from_file(path: &str) -> Result<RulesConfig> {
    let content = std::fs::read_to_string(path)?;
    load_rules_from_yaml(&content)
}

fn compile_rules(config: &RulesConfig) -> Result<HashMap<String, Policy>> {
    let mut policies = HashMap::new();
    for rule in &config.rules {
        if rule.id.is_empty() {
            return Err(GateError::Config("rule id must not be empty".to_string()));
        }
        if !rule.refill_rate_per_second.is_finite() || rule.refill_rate_per_second <= 0.0 {
            return Err(GateError::Config(format!(
                "rule '{}': refill_rate_per_second must be > 0",
                rule.id
            )));
        }
        if rule.capacity == 0 {
            return Err(GateError::Config(format!(
                "rule '{}': capacity must be > 0",
                rule.id
            )));
        }
        let policy = Policy {
            rule_id: rule.id.clone(),
            refill_rate_per_second: rule.refill_rate_per_second,
            capacity: rule.capacity,
        };
        if policies.insert(rule.id.clone(), policy).is_some() {
            return Err(GateError::Config(format!("duplicate rule id '{}'", rule.id)));
        }
    }
    Ok(policies)
}

/// Maps a rule identifier to its policy.
///
/// The rule set is held as an immutable snapshot; `reload` swaps in a new one
/// atomically. A failed reload keeps the previous snapshot in service, so
/// requests keep being decided under stale limits rather than failing.
pub struct PolicyResolver {
    rules_path: Option<PathBuf>,
    snapshot: RwLock<Arc<HashMap<String, Policy>>>,
}

impl PolicyResolver {
    /// Create a resolver from in-memory rule definitions
    pub fn from_rules(config: RulesConfig) -> Result<Self> {
        let policies = compile_rules(&config)?;
        Ok(Self {
            rules_path: None,
            snapshot: RwLock::new(Arc::new(policies)),
        })
    }

    /// Create a resolver backed by a YAML rules file
    pub fn from_file(path: &str) -> Result<Self> {
        let config = load_rules_from_file(path)?;
        let policies = compile_rules(&config)?;
        info!(rules = policies.len(), path = %path, "loaded rate limit rules");
        Ok(Self {
            rules_path: Some(PathBuf::from(path)),
            snapshot: RwLock::new(Arc::new(policies)),
        })
    }

    /// Resolve a rule id to its policy.
    ///
    /// An unknown rule is a configuration error and is surfaced immediately,
    /// never silently defaulted.
    pub async fn resolve(&self, rule_id: &str) -> Result<Policy> {
        let snapshot = self.snapshot.read().await.clone();
        snapshot
            .get(rule_id)
            .cloned()
            .ok_or_else(|| GateError::UnknownRule(rule_id.to_string()))
    }

    /// Re-read the rules file and swap the snapshot.
    ///
    /// On any failure the current snapshot stays in service.
    pub async fn reload(&self) -> Result<usize> {
        let path = match &self.rules_path {
            Some(path) => path.clone(),
            None => {
                return Err(GateError::Config(
                    "resolver has no rules file to reload from".to_string(),
                ))
            }
        };

        let content = std::fs::read_to_string(&path)?;
        let config = load_rules_from_yaml(&content)?;
        let policies = compile_rules(&config)?;
        let count = policies.len();

        let mut snapshot = self.snapshot.write().await;
        *snapshot = Arc::new(policies);
        info!(rules = count, "reloaded rate limit rules");
        Ok(count)
    }

    /// Rule ids currently known to the resolver
    pub async fn rule_ids(&self) -> Vec<String> {
        let snapshot = self.snapshot.read().await.clone();
        snapshot.keys().cloned().collect()
    }
}
