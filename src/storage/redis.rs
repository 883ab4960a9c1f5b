//! Redis storage backend for shared, multi-process deployments.
//!
//! All mutations are single round trips: counter increments run through a
//! Lua script so concurrent writers always observe a consistent
//! post-increment count, and sliding-window writes pipeline the ZADD with
//! the key's EXPIRE.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{RateLimitStorage, StorageError};

/// Connection settings for [`RedisStorage`].
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,

    /// Prefix prepended to every key written by this backend.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-command response timeout in seconds.
    #[serde(default = "default_response_timeout_seconds")]
    pub response_timeout_seconds: u64,
}

fn default_key_prefix() -> String {
    "bulkhead:".to_string()
}

fn default_response_timeout_seconds() -> u64 {
    1
}

/// Shared storage backend over Redis.
pub struct RedisStorage {
    conn: ConnectionManager,
    key_prefix: String,
    response_timeout: Duration,
    increment_script: Script,
}

// INCRBY and EXPIRE in one atomic unit; the EXPIRE only fires when this
// call created the counter, so later increments never extend the window.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if count == tonumber(ARGV[1]) then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

impl RedisStorage {
    /// Connect to Redis and verify the server responds to PING.
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StorageError::Connection(format!("Invalid Redis URL: {e}")))?;

        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to connect to Redis: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to ping Redis server: {e}")))?;

        info!(url = %config.url, key_prefix = %config.key_prefix, "Connected to Redis storage backend");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            response_timeout: Duration::from_secs(config.response_timeout_seconds),
            increment_script: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.response_timeout, fut).await {
            Ok(result) => result.map_err(|e| StorageError::Query(e.to_string())),
            Err(_) => Err(StorageError::Connection(format!(
                "Redis command timed out after {:?}",
                self.response_timeout
            ))),
        }
    }
}

#[async_trait]
impl RateLimitStorage for RedisStorage {
    async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let full_key = self.full_key(key);
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.timed(conn.get(&full_key)).await?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_state(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: u64,
    ) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        let serialized = serde_json::to_string(&value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        self.timed(conn.set_ex::<_, _, ()>(&full_key, serialized, ttl_seconds))
            .await
    }

    async fn increment_counter(
        &self,
        key: &str,
        window_start: u64,
        amount: u32,
        ttl_seconds: u64,
    ) -> Result<u64, StorageError> {
        let full_key = format!("{}:{window_start}", self.full_key(key));
        let mut conn = self.conn.clone();
        let count: u64 = self
            .timed(
                self.increment_script
                    .key(&full_key)
                    .arg(amount)
                    .arg(ttl_seconds)
                    .invoke_async(&mut conn),
            )
            .await?;
        debug!(key = %full_key, count = count, "Incremented window counter");
        Ok(count)
    }

    async fn add_request(
        &self,
        key: &str,
        timestamp: f64,
        ttl_seconds: u64,
    ) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        // Unique member per request so identical timestamps all count.
        let member = format!("{timestamp}-{}", Uuid::new_v4());
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(&full_key, member, timestamp)
            .ignore()
            .expire(&full_key, ttl_seconds as i64)
            .ignore();
        let () = self.timed(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn get_request_count(
        &self,
        key: &str,
        since_timestamp: f64,
    ) -> Result<u64, StorageError> {
        let full_key = self.full_key(key);
        let mut conn = self.conn.clone();
        self.timed(conn.zcount(&full_key, since_timestamp, "+inf"))
            .await
    }

    async fn cleanup_expired(
        &self,
        key: &str,
        before_timestamp: f64,
    ) -> Result<u64, StorageError> {
        let full_key = self.full_key(key);
        let mut conn = self.conn.clone();
        self.timed(conn.zrembyscore(&full_key, "-inf", format!("({before_timestamp}")))
            .await
    }

    async fn delete_state(&self, key: &str) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        let mut conn = self.conn.clone();
        self.timed(conn.del(&full_key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_apply() {
        let config: RedisConfig =
            serde_yaml::from_str("url: redis://localhost:6379").unwrap();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.key_prefix, "bulkhead:");
        assert_eq!(config.response_timeout_seconds, 1);
    }

    #[test]
    fn config_overrides_apply() {
        let yaml = r#"
url: redis://cache.internal:6380
key_prefix: "svc:rl:"
response_timeout_seconds: 3
"#;
        let config: RedisConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.key_prefix, "svc:rl:");
        assert_eq!(config.response_timeout_seconds, 3);
    }
}
