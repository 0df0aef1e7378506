//! Redis-backed counter store.
//!
//! Each primitive is a Lua script, so read, refill, decide and write happen
//! in one atomic round trip on the server. Scripts read the clock with
//! `TIME`, which keeps every instance on the same time base regardless of
//! local clock drift.
//!
//! The connection is a `ConnectionManager`, cloned per call. Clones share
//! one multiplexed connection, so no in-process lock guards it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError, Script};
use tracing::{debug, info};

use super::{slot_millis, BucketSpec, CounterStore, Grant, StoreError, WindowCount};

/// Increment and set the TTL only when the key has none.
///
/// `PTTL` reads 0 in the key's final millisecond; the reply is clamped to 1.
const FIXED_WINDOW_SCRIPT: &str = r#"
local total = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    ttl = tonumber(ARGV[2])
end
return {total, math.max(ttl, 1)}
"#;

/// ARGV: capacity, window ms, slot ms.
const SLOTTED_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local slot = tonumber(ARGV[3])

local state = redis.call('HMGET', KEYS[1], 'last', 'granted', 'anchor')
local last = tonumber(state[1])
local granted = tonumber(state[2]) or 0
local anchor = tonumber(state[3]) or now

if now - anchor >= window then
    anchor = now
    granted = 0
end

if last then
    local since = math.max(now - last, 0)
    if since < slot then
        return {0, math.max(capacity - granted, 0), slot - since}
    end
end

granted = granted + 1
redis.call('HSET', KEYS[1],
    'last', string.format('%d', now),
    'granted', granted,
    'anchor', string.format('%d', anchor))
redis.call('PEXPIRE', KEYS[1], window)
return {1, math.max(capacity - granted, 0), slot}
"#;

/// ARGV: capacity, refill window ms, cost, cooldown ms.
///
/// The balance is kept in units of token * window ms so refill stays integral.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cost = tonumber(ARGV[3]) * window
local cooldown = tonumber(ARGV[4])
local full = capacity * window

local state = redis.call('HMGET', KEYS[1], 'units', 'refilled', 'blocked')
local units = tonumber(state[1]) or full
local refilled = tonumber(state[2]) or now
local blocked = tonumber(state[3]) or 0

units = math.min(units + math.max(now - refilled, 0) * capacity, full)

local allowed = 0
if blocked <= now then
    if units >= cost then
        units = units - cost
        allowed = 1
        if units < cost and cooldown > 0 then
            blocked = now + cooldown
        end
    elseif cooldown > 0 then
        blocked = now + cooldown
    end
end

local wait
if allowed == 1 then
    if units >= full then
        wait = 0
    else
        wait = math.ceil((window - units % window) / capacity)
    end
else
    wait = math.ceil(math.max(cost - units, 0) / capacity)
end
wait = math.max(wait, blocked - now)

redis.call('HSET', KEYS[1],
    'units', string.format('%d', units),
    'refilled', string.format('%d', now),
    'blocked', string.format('%d', blocked))
redis.call('PEXPIRE', KEYS[1], window + cooldown)
return {allowed, math.floor(units / window), wait}
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix put in front of every key, to share one Redis between deployments
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "quorate:".to_string(),
        }
    }
}

/// Counter store shared between instances through Redis.
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    fixed_window: Script,
    slotted: Script,
    token_bucket: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with the default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;

        info!(key_prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            config,
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            slotted: Script::new(SLOTTED_SCRIPT),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

/// Classify a Redis failure.
fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::Unavailable(e.to_string())
    } else if e.kind() == ErrorKind::TypeError {
        StoreError::MalformedReply(e.to_string())
    } else {
        StoreError::Protocol(e.to_string())
    }
}

fn non_negative(value: i64, field: &str) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::MalformedReply(format!("negative {}: {}", field, value)))
}

fn grant_from_reply(reply: (i64, i64, i64)) -> Result<Grant, StoreError> {
    let (allowed, remaining, wait) = reply;
    let allowed = match allowed {
        0 => false,
        1 => true,
        other => {
            return Err(StoreError::MalformedReply(format!(
                "unexpected allowed flag {}",
                other
            )))
        }
    };
    Ok(Grant {
        allowed,
        remaining: non_negative(remaining, "remaining")?,
        ms_until_next: non_negative(wait, "wait")?,
    })
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
    ) -> Result<WindowCount, StoreError> {
        let mut conn = self.connection.clone();
        let (total, ttl_left): (i64, i64) = self
            .fixed_window
            .key(self.key(key))
            .arg(amount)
            .arg(millis(ttl).max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(WindowCount {
            total: non_negative(total, "total")?,
            ms_until_expiry: non_negative(ttl_left, "ttl")?,
        })
    }

    async fn token_bucket_consume(&self, key: &str, spec: BucketSpec) -> Result<Grant, StoreError> {
        let mut conn = self.connection.clone();
        let reply: (i64, i64, i64) = self
            .token_bucket
            .key(self.key(key))
            .arg(spec.capacity)
            .arg(millis(spec.refill_window).max(1))
            .arg(spec.cost)
            .arg(millis(spec.cooldown))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        grant_from_reply(reply)
    }

    async fn slotted_consume(
        &self,
        key: &str,
        capacity: u64,
        window: Duration,
    ) -> Result<Grant, StoreError> {
        let mut conn = self.connection.clone();
        let reply: (i64, i64, i64) = self
            .slotted
            .key(self.key(key))
            .arg(capacity)
            .arg(millis(window).max(1))
            .arg(slot_millis(capacity, window))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        grant_from_reply(reply)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let full_key = self.key(key);
        let removed: i64 = conn.del(&full_key).await.map_err(map_redis_error)?;
        debug!(key = %full_key, removed = removed, "Deleted counter record");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if pong != "PONG" {
            return Err(StoreError::MalformedReply(format!(
                "unexpected PING reply {}",
                pong
            )));
        }
        Ok(())
    }
}
