//! Redis-backed counter store.
//!
//! Lets every gateway process share one set of counters, room rosters and
//! token buckets. Each primitive is a single Redis command or a Lua script, so
//! the limit check and the mutation run as one step on the server.
//!
//! ## Keys
//!
//! - Counters: plain integers, deleted when they return to 0
//! - Rooms: sets of connection ids
//! - Buckets: hashes `{tokens, last}` with a `PEXPIRE` TTL
//!
//! All keys carry the configured prefix (default `rusty-gate:`).
//!
//! ## Example
//!
//! ```rust,ignore
//! use rusty_gate::storage::redis_store::{RedisCounterStore, RedisStoreConfig};
//!
//! let store = RedisCounterStore::connect_with_config(
//!     "redis://127.0.0.1/",
//!     RedisStoreConfig { key_prefix: "gate:".to_string() },
//! )
//! .await?;
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::fmt;

use super::traits::*;
use crate::constants::DEFAULT_KEY_PREFIX;
use crate::error::Result;

const DECREMENT_FLOORED: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 1 then
  redis.call('DEL', KEYS[1])
  return 0
end
return redis.call('DECR', KEYS[1])
"#;

const INCREMENT_BELOW: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current < tonumber(ARGV[1]) then
  return {1, redis.call('INCR', KEYS[1])}
end
return {0, current}
"#;

const SET_ADD_BOUNDED: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  return {1, redis.call('SCARD', KEYS[1])}
end
local size = redis.call('SCARD', KEYS[1])
if size < tonumber(ARGV[2]) then
  redis.call('SADD', KEYS[1], ARGV[1])
  return {1, size + 1}
end
return {0, size}
"#;

// Same arithmetic as `BucketRequest::apply`
const TOKEN_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

local elapsed = math.max(0, now - last)
tokens = math.max(0, math.min(capacity, tokens + elapsed / 1000 * rate))
last = math.max(last, now)

local allowed = 0
local retry_after = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
else
  retry_after = math.ceil((cost - tokens) / rate * 1000)
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last', tostring(last))
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, retry_after, tostring(tokens)}
"#;

/// Configuration for the Redis store
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Key prefix for every Redis key (default: "rusty-gate:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Redis-backed implementation of [`CounterStore`]
#[derive(Clone)]
pub struct RedisCounterStore {
    // ConnectionManager is a cheaply cloneable multiplexed handle
    connection: ConnectionManager,
    config: RedisStoreConfig,
    decrement_script: Script,
    increment_below_script: Script,
    set_add_script: Script,
    bucket_script: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if connection fails.
    pub async fn connect(url: &str) -> std::result::Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> std::result::Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            config,
            decrement_script: Script::new(DECREMENT_FLOORED),
            increment_below_script: Script::new(INCREMENT_BELOW),
            set_add_script: Script::new(SET_ADD_BOUNDED),
            bucket_script: Script::new(TOKEN_BUCKET),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(self.key(key), 1).await?;
        Ok(value)
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = self
            .decrement_script
            .key(self.key(key))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = conn.get(self.key(key)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn increment_below(&self, key: &str, limit: i64) -> Result<LimitedIncrement> {
        let mut conn = self.connection.clone();
        let (incremented, value): (i64, i64) = self
            .increment_below_script
            .key(self.key(key))
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(LimitedIncrement {
            incremented: incremented == 1,
            value,
        })
    }

    async fn set_add_bounded(&self, key: &str, member: &str, max_members: usize) -> Result<BoundedAdd> {
        let mut conn = self.connection.clone();
        let (added, size): (i64, usize) = self
            .set_add_script
            .key(self.key(key))
            .arg(member)
            .arg(max_members)
            .invoke_async(&mut conn)
            .await?;
        Ok(BoundedAdd {
            added: added == 1,
            size,
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.srem(self.key(key), member).await?;
        Ok(removed > 0)
    }

    async fn set_size(&self, key: &str) -> Result<usize> {
        let mut conn = self.connection.clone();
        let size: usize = conn.scard(self.key(key)).await?;
        Ok(size)
    }

    async fn token_bucket(&self, key: &str, request: &BucketRequest) -> Result<BucketOutcome> {
        let mut conn = self.connection.clone();
        let (allowed, retry_after_ms, tokens): (i64, u64, String) = self
            .bucket_script
            .key(self.key(key))
            .arg(request.capacity)
            .arg(request.refill_per_sec)
            .arg(request.cost)
            .arg(request.now_ms)
            .arg(request.ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(BucketOutcome {
            allowed: allowed == 1,
            retry_after_ms,
            tokens: tokens.parse().unwrap_or(0.0),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }
}
