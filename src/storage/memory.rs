//! In-process storage backend.
//!
//! State lives in sharded maps keyed by the derived storage key. Expired
//! entries are dropped lazily when touched; a host that wants bounded
//! memory under churn can additionally call [`MemoryStorage::purge_expired`]
//! on a timer.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{RateLimitStorage, StorageError};

/// A stored value with its expiry deadline in epoch seconds.
#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: f64,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl_seconds: u64) -> Self {
        Self {
            value,
            expires_at: now_secs() + ttl_seconds as f64,
        }
    }

    fn is_expired(&self, now: f64) -> bool {
        self.expires_at <= now
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// In-memory storage backend.
///
/// Suitable for single-process deployments and tests. Counter increments
/// are atomic per key through shard-exclusive entry access.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: DashMap<String, Expiring<serde_json::Value>>,
    counters: DashMap<String, Expiring<u64>>,
    requests: DashMap<String, Expiring<Vec<f64>>>,
}

impl MemoryStorage {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep every map and drop expired entries, returning the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_secs();
        let before =
            self.blobs.len() + self.counters.len() + self.requests.len();
        self.blobs.retain(|_, entry| !entry.is_expired(now));
        self.counters.retain(|_, entry| !entry.is_expired(now));
        self.requests.retain(|_, entry| !entry.is_expired(now));
        let removed = before
            - (self.blobs.len() + self.counters.len() + self.requests.len());
        if removed > 0 {
            trace!(removed = removed, "Purged expired storage entries");
        }
        removed
    }

    /// Number of live entries across all maps (expired but unswept entries
    /// included).
    pub fn len(&self) -> usize {
        self.blobs.len() + self.counters.len() + self.requests.len()
    }

    /// Returns true if no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry whose key starts with `prefix`, returning the
    /// number removed.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let before = self.len();
        self.blobs.retain(|key, _| !key.starts_with(prefix));
        self.counters.retain(|key, _| !key.starts_with(prefix));
        self.requests.retain(|key, _| !key.starts_with(prefix));
        before - self.len()
    }
}

#[async_trait]
impl RateLimitStorage for MemoryStorage {
    async fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let now = now_secs();
        if let Some(entry) = self.blobs.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Drop lazily outside the read guard to avoid shard deadlock.
        self.blobs.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set_state(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: u64,
    ) -> Result<(), StorageError> {
        self.blobs
            .insert(key.to_string(), Expiring::new(value, ttl_seconds));
        Ok(())
    }

    async fn increment_counter(
        &self,
        key: &str,
        window_start: u64,
        amount: u32,
        ttl_seconds: u64,
    ) -> Result<u64, StorageError> {
        let now = now_secs();
        let counter_key = format!("{key}:{window_start}");
        let mut entry = self
            .counters
            .entry(counter_key)
            .or_insert_with(|| Expiring::new(0, ttl_seconds));
        if entry.is_expired(now) {
            *entry = Expiring::new(0, ttl_seconds);
        }
        entry.value += u64::from(amount);
        Ok(entry.value)
    }

    async fn add_request(
        &self,
        key: &str,
        timestamp: f64,
        ttl_seconds: u64,
    ) -> Result<(), StorageError> {
        let now = now_secs();
        let mut entry = self
            .requests
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(Vec::new(), ttl_seconds));
        if entry.is_expired(now) {
            entry.value.clear();
        }
        entry.value.push(timestamp);
        // Each write extends the set's life; individual timestamps are
        // pruned by cleanup_expired.
        entry.expires_at = now + ttl_seconds as f64;
        Ok(())
    }

    async fn get_request_count(
        &self,
        key: &str,
        since_timestamp: f64,
    ) -> Result<u64, StorageError> {
        let now = now_secs();
        match self.requests.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(entry
                .value
                .iter()
                .filter(|ts| **ts >= since_timestamp)
                .count() as u64),
            _ => Ok(0),
        }
    }

    async fn cleanup_expired(
        &self,
        key: &str,
        before_timestamp: f64,
    ) -> Result<u64, StorageError> {
        if let Some(mut entry) = self.requests.get_mut(key) {
            let before = entry.value.len();
            entry.value.retain(|ts| *ts >= before_timestamp);
            return Ok((before - entry.value.len()) as u64);
        }
        Ok(0)
    }

    async fn delete_state(&self, key: &str) -> Result<(), StorageError> {
        self.blobs.remove(key);
        self.counters.remove(key);
        self.requests.remove(key);
        Ok(())
    }
}
