use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    bucket::{BucketState, CheckOutcome},
    error::{GateError, Result},
    policy::Policy,
    shard::HashRing,
    store::TokenStore,
};

/// Atomic refill-and-consume, executed server-side so no other operation can
/// observe or mutate the key between read and write. Mirrors
/// `bucket::refill_and_consume` exactly; the clock is the caller-supplied
/// `now`, never the Redis node's. Fractional values are returned as strings
/// because Lua replies truncate numbers to integers.
const CHECK_AND_CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1]) or capacity
local last_refill = tonumber(state[2]) or now

local elapsed = now - last_refill
if elapsed < 0 then
  elapsed = 0
end
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HMSET', key, 'tokens', tokens, 'last_refill', now)
redis.call('EXPIRE', key, ttl)

local reset
if rate <= 0 then
  reset = now + 31536000
elseif tokens >= 1 then
  reset = now
else
  reset = now + (1 - tokens) / rate
end

return {allowed, tostring(tokens), tostring(reset)}
"#;

/// Connection settings shared by every shard client
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub connection_timeout: Duration,
    /// Per-command budget. Sized so a check plus one retry stays inside the
    /// overall decision latency target.
    pub command_timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_millis(1000),
        }
    }
}

/// Address pair for one shard: writes go to the primary, the replica is the
/// bounded-retry endpoint during a primary failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    pub primary_url: String,
    #[serde(default)]
    pub replica_url: Option<String>,
}

/// One Redis connection with a command timeout
#[derive(Clone)]
struct RedisClient {
    connection: ConnectionManager,
    command_timeout: Duration,
}

impl RedisClient {
    async fn connect(url: &str, settings: &RedisSettings) -> Result<Self> {
        debug!("connecting Redis client to {}", url);

        let client = redis::Client::open(url)?;

        let connection = match tokio::time::timeout(
            settings.connection_timeout,
            client.get_connection_manager(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("failed to create connection manager for {}: {}", url, e);
                return Err(GateError::Redis(e));
            }
            Err(_) => {
                return Err(GateError::StoreUnavailable(format!(
                    "timeout connecting to {}",
                    url
                )));
            }
        };

        let redis_client = Self {
            connection,
            command_timeout: settings.command_timeout,
        };
        redis_client.ping().await?;
        info!("Redis client connected to {}", url);
        Ok(redis_client)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.bounded(redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }

    async fn check_and_consume(
        &self,
        key: &str,
        policy: &Policy,
        now: f64,
        ttl_secs: u64,
    ) -> Result<CheckOutcome> {
        let script = redis::Script::new(CHECK_AND_CONSUME_SCRIPT);
        let mut conn = self.connection.clone();

        let (allowed, tokens, reset): (i64, String, String) = self
            .bounded(
                script
                    .key(key)
                    .arg(policy.refill_rate_per_second)
                    .arg(policy.capacity)
                    .arg(now)
                    .arg(ttl_secs)
                    .invoke_async(&mut conn),
            )
            .await?;

        let tokens_remaining = parse_float(&tokens, "tokens")?;
        let reset_time = parse_float(&reset, "reset")?;

        Ok(CheckOutcome {
            allowed: allowed == 1,
            tokens_remaining,
            reset_time,
        })
    }

    async fn peek(&self, key: &str) -> Result<Option<BucketState>> {
        let mut conn = self.connection.clone();
        let (tokens, last_refill): (Option<String>, Option<String>) = self
            .bounded(
                redis::cmd("HMGET")
                    .arg(key)
                    .arg("tokens")
                    .arg("last_refill")
                    .query_async(&mut conn),
            )
            .await?;

        match (tokens, last_refill) {
            (Some(tokens), Some(last_refill)) => Ok(Some(BucketState {
                tokens: parse_float(&tokens, "tokens")?,
                last_refill: parse_float(&last_refill, "last_refill")?,
            })),
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .bounded(redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    /// Run a Redis future under the command timeout. A timed-out command is
    /// a store failure for this request only, never a hang.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GateError::Redis(e)),
            Err(_) => Err(GateError::StoreUnavailable(format!(
                "command exceeded {}ms budget",
                self.command_timeout.as_millis()
            ))),
        }
    }
}

fn parse_float(value: &str, field: &str) -> Result<f64> {
    value.parse::<f64>().map_err(|_| {
        GateError::StoreUnavailable(format!("malformed {} value from store: {}", field, value))
    })
}

struct RedisShard {
    primary: RedisClient,
    replica: Option<RedisClient>,
}

/// Sharded, replicated token store.
///
/// Store keys route to shards through a consistent-hash ring so a key's
/// operations always land on one shard. Writes target the primary; if the
/// primary cannot execute the atomic operation, exactly one retry goes to
/// the replica endpoint (which takes writes after a failover promotion)
/// before the error propagates for the fail-closed policy to handle.
pub struct ShardedRedisStore {
    shards: Vec<RedisShard>,
    ring: HashRing,
    key_ttl_secs: u64,
}

impl ShardedRedisStore {
    pub async fn connect(
        configs: &[ShardConfig],
        settings: &RedisSettings,
        key_ttl_secs: u64,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(GateError::Config(
                "at least one Redis shard must be configured".to_string(),
            ));
        }

        let mut shards = Vec::with_capacity(configs.len());
        for config in configs {
            let primary = RedisClient::connect(&config.primary_url, settings).await?;
            let replica = match &config.replica_url {
                Some(url) => Some(RedisClient::connect(url, settings).await?),
                None => None,
            };
            shards.push(RedisShard { primary, replica });
        }

        let ring = HashRing::new(shards.len())?;
        info!(shards = shards.len(), "sharded Redis store ready");

        Ok(Self {
            shards,
            ring,
            key_ttl_secs,
        })
    }

    fn shard_for(&self, key: &str) -> &RedisShard {
        &self.shards[self.ring.route(key)]
    }
}

#[async_trait]
impl TokenStore for ShardedRedisStore {
    async fn check_and_consume(
        &self,
        key: &str,
        policy: &Policy,
        now: f64,
    ) -> Result<CheckOutcome> {
        let shard = self.shard_for(key);

        let first = shard
            .primary
            .check_and_consume(key, policy, now, self.key_ttl_secs)
            .await;

        match first {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_store_failure() => {
                warn!("primary check failed for {}, retrying once: {}", key, e);
                let fallback = shard.replica.as_ref().unwrap_or(&shard.primary);
                fallback
                    .check_and_consume(key, policy, now, self.key_ttl_secs)
                    .await
                    .map_err(|retry_err| {
                        GateError::StoreUnavailable(format!(
                            "shard unreachable after retry: {}",
                            retry_err
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }

    async fn peek(&self, key: &str) -> Result<Option<BucketState>> {
        let shard = self.shard_for(key);
        match shard.primary.peek(key).await {
            Ok(state) => Ok(state),
            Err(e) if e.is_store_failure() => match &shard.replica {
                Some(replica) => replica.peek(key).await,
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        self.shard_for(key).primary.delete(key).await
    }

    async fn health_check(&self) -> Result<()> {
        for shard in &self.shards {
            shard.primary.ping().await?;
            if let Some(replica) = &shard.replica {
                replica.ping().await?;
            }
        }
        Ok(())
    }
}
