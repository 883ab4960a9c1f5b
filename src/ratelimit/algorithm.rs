//! Admission algorithm strategies.
//!
//! Each algorithm implements [`AdmissionAlgorithm`] against the storage
//! contract, so the limiter dispatches without knowing any algorithm's
//! internals and new algorithms require no dispatcher changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::rule::{Algorithm, RateLimitRule};
use crate::storage::{RateLimitStorage, StorageError};

/// Outcome of an algorithm check, before the limiter attaches rule metadata.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_time: u64,
    pub retry_after: Option<u64>,
    pub current_usage: u32,
}

/// Strategy contract for admission algorithms.
///
/// `now` is epoch seconds; the limiter supplies the wall clock so that
/// algorithm behavior is driven by explicit timestamps.
#[async_trait]
pub(crate) trait AdmissionAlgorithm: Send + Sync {
    async fn check(
        &self,
        rule: &RateLimitRule,
        key: &str,
        weight: u32,
        now: f64,
        storage: &dyn RateLimitStorage,
    ) -> Result<Decision, StorageError>;
}

/// Resolve the strategy for a rule's configured algorithm.
pub(crate) fn for_kind(algorithm: Algorithm) -> &'static dyn AdmissionAlgorithm {
    match algorithm {
        Algorithm::TokenBucket => &TokenBucket,
        Algorithm::SlidingWindow => &SlidingWindow,
        Algorithm::FixedWindow => &FixedWindow,
    }
}

/// Persisted token bucket state, stored as a JSON blob per (rule, identifier).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// Tokens currently available; `0 <= tokens <= capacity` at every
    /// observation.
    pub tokens: f64,
    /// Epoch seconds of the last refill computation.
    pub last_refill: f64,
    /// Bucket capacity at the time of persistence.
    pub capacity: u32,
    /// Refill rate in tokens per second at the time of persistence.
    pub refill_rate: f64,
}

impl TokenBucketState {
    fn fresh(rule: &RateLimitRule, now: f64) -> Self {
        Self {
            tokens: f64::from(rule.capacity()),
            last_refill: now,
            capacity: rule.capacity(),
            refill_rate: rule.refill_rate(),
        }
    }
}

/// Token bucket: lazy refill on each check, burst capacity above the
/// nominal rate, converging to the average rate over time.
pub(crate) struct TokenBucket;

#[async_trait]
impl AdmissionAlgorithm for TokenBucket {
    async fn check(
        &self,
        rule: &RateLimitRule,
        key: &str,
        weight: u32,
        now: f64,
        storage: &dyn RateLimitStorage,
    ) -> Result<Decision, StorageError> {
        let capacity = rule.capacity();
        let refill_rate = rule.refill_rate();
        let ttl = rule.window_seconds * 2;

        let mut bucket = match storage.get_state(key).await? {
            Some(blob) => match serde_json::from_value::<TokenBucketState>(blob) {
                Ok(state) => state,
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding undecodable token bucket state");
                    TokenBucketState::fresh(rule, now)
                }
            },
            None => TokenBucketState::fresh(rule, now),
        };

        // Refill lazily from elapsed wall time, then apply the rule's
        // current parameters in case the rule was replaced since the
        // state was written.
        let elapsed = (now - bucket.last_refill).max(0.0);
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(f64::from(capacity));
        bucket.last_refill = now;
        bucket.capacity = capacity;
        bucket.refill_rate = refill_rate;

        let allowed = bucket.tokens >= f64::from(weight);
        let retry_after = if allowed {
            bucket.tokens -= f64::from(weight);
            None
        } else {
            let deficit = f64::from(weight) - bucket.tokens;
            Some((deficit / refill_rate).ceil() as u64)
        };

        let remaining = bucket.tokens.floor() as u32;
        let reset_time = {
            let until_full = (f64::from(capacity) - bucket.tokens) / refill_rate;
            (now + until_full).ceil() as u64
        };

        let blob = serde_json::to_value(&bucket)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        storage.set_state(key, blob, ttl).await?;

        Ok(Decision {
            allowed,
            remaining,
            reset_time,
            retry_after,
            current_usage: capacity.saturating_sub(remaining),
        })
    }
}

/// Sliding window: exact timestamps over a continuously moving interval.
/// No boundary double-counting; storage cost scales with request volume.
pub(crate) struct SlidingWindow;

#[async_trait]
impl AdmissionAlgorithm for SlidingWindow {
    async fn check(
        &self,
        rule: &RateLimitRule,
        key: &str,
        weight: u32,
        now: f64,
        storage: &dyn RateLimitStorage,
    ) -> Result<Decision, StorageError> {
        let window = rule.window_seconds as f64;
        let window_start = now - window;
        let ttl = rule.window_seconds * 2;

        storage.cleanup_expired(key, window_start).await?;
        let count = storage.get_request_count(key, window_start).await?;

        let allowed = count + u64::from(weight) <= u64::from(rule.requests);
        if allowed {
            for _ in 0..weight {
                storage.add_request(key, now, ttl).await?;
            }
        }

        let usage = if allowed { count + u64::from(weight) } else { count };
        let remaining = u64::from(rule.requests).saturating_sub(usage);
        Ok(Decision {
            allowed,
            remaining: remaining.min(u64::from(u32::MAX)) as u32,
            reset_time: (now + window).ceil() as u64,
            // Upper bound: after one full window every recorded request
            // has aged out.
            retry_after: (!allowed).then_some(rule.window_seconds),
            current_usage: usage.min(u64::from(u32::MAX)) as u32,
        })
    }
}

/// Fixed window: one atomic counter per discrete window. Admission is
/// judged on the atomically returned post-increment count, so concurrent
/// callers cannot both pass a stale pre-check; the cost is that rejected
/// attempts consume window quota until the window rolls.
pub(crate) struct FixedWindow;

#[async_trait]
impl AdmissionAlgorithm for FixedWindow {
    async fn check(
        &self,
        rule: &RateLimitRule,
        key: &str,
        weight: u32,
        now: f64,
        storage: &dyn RateLimitStorage,
    ) -> Result<Decision, StorageError> {
        let window = rule.window_seconds;
        let window_start = (now as u64 / window) * window;
        let window_end = window_start + window;
        let ttl = window * 2;

        let count = storage
            .increment_counter(key, window_start, weight, ttl)
            .await?;

        let allowed = count <= u64::from(rule.requests);
        let remaining = u64::from(rule.requests).saturating_sub(count);
        let retry_after =
            (!allowed).then(|| ((window_end as f64 - now).ceil() as u64).min(window));

        Ok(Decision {
            allowed,
            remaining: remaining.min(u64::from(u32::MAX)) as u32,
            reset_time: window_end,
            retry_after,
            current_usage: count.min(u64::from(u32::MAX)) as u32,
        })
    }
}
