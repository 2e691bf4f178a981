use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::{
    bucket::{refill_and_consume, BucketState, CheckOutcome},
    error::Result,
    policy::Policy,
};

/// Default prefix for bucket keys in the store.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Build the store key for an (identity, rule) pair
pub fn store_key(prefix: &str, client_id: &str, rule_id: &str) -> String {
    format!("{}:{}:{}", prefix, client_id, rule_id)
}

/// A key-value store holding per-identity bucket state.
///
/// Bucket state is owned exclusively by the store and mutated only inside
/// `check_and_consume`; callers never read-then-write it. The caller
/// supplies `now` (epoch seconds) so the operation is a pure function of
/// stored state, policy and clock, independent of store-node time.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Atomically refill the bucket for elapsed time and attempt to consume
    /// one token. All-or-nothing: a failure means no partial state change
    /// was observed.
    async fn check_and_consume(&self, key: &str, policy: &Policy, now: f64)
        -> Result<CheckOutcome>;

    /// Read raw bucket state without consuming. `None` means no record,
    /// which is equivalent to a full bucket.
    async fn peek(&self, key: &str) -> Result<Option<BucketState>>;

    /// Delete the bucket. The next access recreates it full.
    async fn reset(&self, key: &str) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

/// Single-process token store running the same algorithm as the Redis
/// backend. Serves tests and single-node deployments where a shared store
/// is not worth operating.
#[derive(Default)]
pub struct MemoryTokenStore {
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn check_and_consume(
        &self,
        key: &str,
        policy: &Policy,
        now: f64,
    ) -> Result<CheckOutcome> {
        // The map lock serializes all mutations to a key, standing in for
        // the server-side atomicity of the Redis script.
        let mut buckets = self.buckets.lock().await;
        let (next, outcome) = refill_and_consume(buckets.get(key).copied(), policy, now);
        buckets.insert(key.to_string(), next);
        Ok(outcome)
    }

    async fn peek(&self, key: &str) -> Result<Option<BucketState>> {
        let buckets = self.buckets.lock().await;
        Ok(buckets.get(key).copied())
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut buckets = self.buckets.lock().await;
        Ok(buckets.remove(key).is_some())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
