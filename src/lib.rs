//! Bulkhead - Traffic Resilience Library
//!
//! This crate implements the protective layer a host service puts between
//! itself and its traffic: multi-algorithm rate limiting (token bucket,
//! sliding window, fixed window) over pluggable storage, and circuit
//! breakers that isolate failing downstream dependencies. It is a library
//! with no transport of its own; the host owns routing, authentication,
//! and response translation.

pub mod breaker;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod storage;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState};
pub use config::ResilienceConfig;
pub use error::{BreakerError, Error, Result};
pub use ratelimit::{Algorithm, RateLimitResult, RateLimitRule, RateLimiter, Scope};
pub use storage::{MemoryStorage, RateLimitStorage, RedisStorage, StorageError};
