use http::HeaderMap;
use moka::{future::Cache, Expiry};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, warn};

use crate::{
    bucket::reset_epoch,
    error::Result,
    identity::IdentityExtractor,
    metrics::Metrics,
    policy::PolicyResolver,
    store::{store_key, TokenStore},
};

/// Current wall-clock time as fractional epoch seconds.
///
/// The gateway's clock is the single time source per check; the store never
/// consults its own.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs_f64()
}

/// Why a check did not pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The bucket had no whole token left.
    TokensExhausted,
    /// The store could not execute the atomic operation; fail-closed.
    StoreUnavailable,
}

/// Request-scoped admission decision. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub passed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which at least one token will be available.
    pub reset_time: i64,
    pub reason: Option<DenyReason>,
}

/// Non-consuming view of one bucket, for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub tokens: f64,
    pub capacity: u32,
    pub rate: f64,
    pub last_refill: f64,
    pub reset_time: i64,
}

/// Entry in the local deny cache. The expiry equals the time left until the
/// bucket accrues its next token, so a cached deny can never outlive the
/// denial it mirrors.
#[derive(Clone, Debug)]
struct CachedDeny {
    limit: u32,
    reset_time: i64,
    expires_in: Duration,
}

struct DenyExpiry;

impl Expiry<String, CachedDeny> for DenyExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedDeny,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(value.expires_in)
    }
}

/// Orchestrator options beyond the component handles
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    pub key_prefix: String,
    pub deny_cache_enabled: bool,
    pub deny_cache_size: u64,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            key_prefix: crate::store::DEFAULT_KEY_PREFIX.to_string(),
            deny_cache_enabled: true,
            deny_cache_size: 10_000,
        }
    }
}

/// The per-request decision orchestrator: extract identity, resolve policy,
/// run the atomic check, apply the failure policy.
///
/// Holds no bucket state of its own; the only shared mutable state lives in
/// the token store, serialized there by the atomic operation.
pub struct RateLimiter {
    extractor: IdentityExtractor,
    resolver: Arc<PolicyResolver>,
    store: Arc<dyn TokenStore>,
    metrics: Arc<Metrics>,
    key_prefix: String,
    deny_cache: Option<Cache<String, CachedDeny>>,
}

impl RateLimiter {
    pub fn new(
        extractor: IdentityExtractor,
        resolver: Arc<PolicyResolver>,
        store: Arc<dyn TokenStore>,
        metrics: Arc<Metrics>,
        options: LimiterOptions,
    ) -> Self {
        let deny_cache = if options.deny_cache_enabled {
            Some(
                Cache::builder()
                    .max_capacity(options.deny_cache_size)
                    .expire_after(DenyExpiry)
                    .build(),
            )
        } else {
            None
        };

        Self {
            extractor,
            resolver,
            store,
            metrics,
            key_prefix: options.key_prefix,
            deny_cache,
        }
    }

    /// Derive the client identity for a request. Total, never fails.
    pub fn extract_identity(&self, headers: &HeaderMap, peer_addr: Option<SocketAddr>) -> String {
        self.extractor.extract(headers, peer_addr)
    }

    /// Decision API: check one (client, rule) pair against the current clock.
    pub async fn check(&self, client_id: &str, rule_id: &str) -> Result<Decision> {
        self.check_at(client_id, rule_id, unix_now()).await
    }

    /// Check with an explicit clock. The whole decision is a function of
    /// stored state, policy and `now`, which is what makes it testable.
    pub async fn check_at(&self, client_id: &str, rule_id: &str, now: f64) -> Result<Decision> {
        let _timer = self.metrics.start_decision_timer();

        let policy = match self.resolver.resolve(rule_id).await {
            Ok(policy) => policy,
            Err(e) => {
                // A missing rule is a deployment bug, not a rate-limit
                // decision. Surface it, never default.
                self.metrics.record_unknown_rule();
                return Err(e);
            }
        };

        let key = store_key(&self.key_prefix, client_id, rule_id);

        if let Some(cache) = &self.deny_cache {
            if let Some(cached) = cache.get(&key).await {
                self.metrics.record_deny_cache_hit();
                debug!(key = %key, "denied from local cache");
                return Ok(Decision {
                    passed: false,
                    limit: cached.limit,
                    remaining: 0,
                    reset_time: cached.reset_time,
                    reason: Some(DenyReason::TokensExhausted),
                });
            }
        }

        let op_start = Instant::now();
        let result = self.store.check_and_consume(&key, &policy, now).await;
        self.metrics.observe_store_op(op_start.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                let decision = Decision {
                    passed: outcome.allowed,
                    limit: policy.capacity,
                    remaining: outcome.tokens_remaining as u32,
                    reset_time: reset_epoch(outcome.reset_time),
                    reason: if outcome.allowed {
                        None
                    } else {
                        Some(DenyReason::TokensExhausted)
                    },
                };

                if outcome.allowed {
                    self.metrics.record_allowed(rule_id);
                } else {
                    self.metrics.record_denied(rule_id);
                    self.cache_denial(&key, &decision).await;
                }

                debug!(
                    client = %client_id,
                    rule = %rule_id,
                    passed = decision.passed,
                    remaining = decision.remaining,
                    "admission check"
                );
                Ok(decision)
            }
            Err(e) if e.is_store_failure() => {
                // Fail closed: with the limiter's own state unverifiable,
                // protecting downstream capacity wins over admitting the
                // request. Same 429 shape as an exhausted bucket.
                warn!(client = %client_id, rule = %rule_id, "store unavailable, failing closed: {}", e);
                self.metrics.record_store_failure();
                self.metrics.record_fail_closed(rule_id);
                Ok(Decision {
                    passed: false,
                    limit: policy.capacity,
                    remaining: 0,
                    reset_time: reset_epoch(now + 1.0),
                    reason: Some(DenyReason::StoreUnavailable),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Record a denial locally until the bucket's next token accrues, so
    /// repeat offenders skip the store round trip.
    async fn cache_denial(&self, key: &str, decision: &Decision) {
        let Some(cache) = &self.deny_cache else {
            return;
        };
        let ttl = decision.reset_time as f64 - unix_now();
        if ttl > 0.0 {
            cache
                .insert(
                    key.to_string(),
                    CachedDeny {
                        limit: decision.limit,
                        reset_time: decision.reset_time,
                        expires_in: Duration::from_secs_f64(ttl),
                    },
                )
                .await;
        }
    }

    /// Current bucket status without consuming a token
    pub async fn status(&self, client_id: &str, rule_id: &str) -> Result<BucketStatus> {
        let policy = self.resolver.resolve(rule_id).await?;
        let key = store_key(&self.key_prefix, client_id, rule_id);
        let now = unix_now();

        let (tokens, last_refill) = match self.store.peek(&key).await? {
            Some(state) => {
                let elapsed = (now - state.last_refill).max(0.0);
                let tokens = (state.tokens + elapsed * policy.refill_rate_per_second)
                    .min(policy.capacity as f64);
                (tokens, state.last_refill)
            }
            None => (policy.capacity as f64, now),
        };

        let reset_time = if tokens >= 1.0 {
            reset_epoch(now)
        } else {
            reset_epoch(now + (1.0 - tokens) / policy.refill_rate_per_second)
        };

        Ok(BucketStatus {
            tokens,
            capacity: policy.capacity,
            rate: policy.refill_rate_per_second,
            last_refill,
            reset_time,
        })
    }

    /// Admin operation: restore a bucket to full
    pub async fn reset(&self, client_id: &str, rule_id: &str) -> Result<bool> {
        let key = store_key(&self.key_prefix, client_id, rule_id);
        if let Some(cache) = &self.deny_cache {
            cache.invalidate(&key).await;
        }
        self.store.reset(&key).await
    }

    /// Reload the rule snapshot, keeping the stale one on failure
    pub async fn reload_rules(&self) {
        match self.resolver.reload().await {
            Ok(_) => self.metrics.record_rules_reload_success(),
            Err(e) => {
                self.metrics.record_rules_reload_error();
                warn!("rules reload failed, serving previous snapshot: {}", e);
            }
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}
