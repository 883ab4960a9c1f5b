//! Error types for the bulkhead library.

use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageError;

/// Main error type for bulkhead operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bulkhead operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by a circuit-breaker-guarded call.
///
/// Parameterized over the caller's own error type so that downstream
/// failures pass through unchanged.
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The breaker is open and the call was rejected without executing.
    #[error("circuit breaker '{name}' is open, retry after {retry_after:?}")]
    Open {
        /// Name of the rejecting breaker.
        name: String,
        /// Time remaining until the breaker will attempt recovery.
        retry_after: Duration,
    },

    /// The call ran longer than the configured timeout and was abandoned.
    #[error("circuit breaker '{name}' call timed out after {elapsed:?}")]
    Timeout {
        /// Name of the enforcing breaker.
        name: String,
        /// How long the call ran before being cut off.
        elapsed: Duration,
    },

    /// The call executed and failed with the caller's own error.
    #[error("downstream call failed: {0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns true if the call was rejected because the breaker is open.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Returns true if the call was abandoned due to timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout { .. })
    }

    /// Time until the breaker will allow a trial call, if rejected while open.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BreakerError::Open { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Unwraps the caller's error, if the call executed and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}
