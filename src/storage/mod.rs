//! Storage backends for rate limit state.
//!
//! Algorithms persist their state (token bucket blobs, fixed-window
//! counters, sliding-window timestamps) through the [`RateLimitStorage`]
//! trait so that the same admission logic runs against an in-process map
//! or a shared Redis deployment.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStorage;
pub use self::redis::{RedisConfig, RedisStorage};

/// Errors that can occur in storage backends.
///
/// Callers above the storage layer convert these to fail-open decisions;
/// they never surface as request rejections.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Could not reach or authenticate with the backend.
    #[error("Storage connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed an individual operation.
    #[error("Storage query error: {0}")]
    Query(String),

    /// Persisted state could not be encoded or decoded.
    #[error("Storage serialization error: {0}")]
    Serialization(String),
}

/// Backend contract for persisting rate limit state.
///
/// Keys arriving here are already fully derived (prefix, rule, scope,
/// hashed identifier); backends treat them as opaque strings. Every entry
/// written carries a TTL so idle identifiers expire without cleanup.
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    /// Fetch an opaque JSON state blob, if present and unexpired.
    async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;

    /// Store an opaque JSON state blob with a TTL in seconds.
    async fn set_state(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: u64,
    ) -> Result<(), StorageError>;

    /// Atomically add `amount` to the counter for `key` within the window
    /// starting at `window_start`, returning the post-increment count.
    ///
    /// The returned value is the single source of truth for fixed-window
    /// admission; there is no separate read or decrement round trip.
    async fn increment_counter(
        &self,
        key: &str,
        window_start: u64,
        amount: u32,
        ttl_seconds: u64,
    ) -> Result<u64, StorageError>;

    /// Record one request timestamp in the ordered set for `key`.
    ///
    /// Duplicate timestamps must all count; backends disambiguate entries
    /// internally.
    async fn add_request(
        &self,
        key: &str,
        timestamp: f64,
        ttl_seconds: u64,
    ) -> Result<(), StorageError>;

    /// Count recorded timestamps at or after `since_timestamp`.
    async fn get_request_count(
        &self,
        key: &str,
        since_timestamp: f64,
    ) -> Result<u64, StorageError>;

    /// Drop recorded timestamps strictly before `before_timestamp`,
    /// returning the number pruned.
    async fn cleanup_expired(
        &self,
        key: &str,
        before_timestamp: f64,
    ) -> Result<u64, StorageError>;

    /// Remove all state stored under exactly `key`.
    ///
    /// The only non-TTL deletion path; used by explicit administrative
    /// resets.
    async fn delete_state(&self, key: &str) -> Result<(), StorageError>;
}
