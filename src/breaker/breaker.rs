//! Circuit breaker state machine.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BreakerError, Error, Result};

/// Capacity of the recent-latency ring buffer.
const LATENCY_RING_CAPACITY: usize = 100;

/// Breaker position in the failure-isolation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// Trial calls probe whether the dependency has recovered.
    HalfOpen,
}

/// Immutable breaker policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Breaker name, used in logs, errors, and the manager registry.
    pub name: String,
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to stay open before admitting a trial call.
    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: f64,
    /// Consecutive half-open successes that close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Hard timeout applied to every wrapped call.
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: f64,
    /// Latency above which a call is counted as slow. Diagnostic only;
    /// slow calls never open the circuit.
    #[serde(default = "default_slow_call_threshold_seconds")]
    pub slow_call_threshold_seconds: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_seconds() -> f64 {
    60.0
}

fn default_success_threshold() -> u32 {
    2
}

fn default_call_timeout_seconds() -> f64 {
    30.0
}

fn default_slow_call_threshold_seconds() -> f64 {
    5.0
}

impl CircuitBreakerConfig {
    /// Create a config with default thresholds for the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout_seconds(),
            success_threshold: default_success_threshold(),
            call_timeout_seconds: default_call_timeout_seconds(),
            slow_call_threshold_seconds: default_slow_call_threshold_seconds(),
        }
    }

    /// Set the consecutive-failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open-state recovery timeout.
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Set the half-open success threshold.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Set the slow-call latency threshold.
    pub fn with_slow_call_threshold(mut self, threshold: Duration) -> Self {
        self.slow_call_threshold_seconds = threshold.as_secs_f64();
        self
    }

    /// Check the config's fields for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config(
                "Circuit breaker has an empty name".to_string(),
            ));
        }
        if self.failure_threshold < 1 {
            return Err(Error::Config(format!(
                "Breaker '{}': failure_threshold must be at least 1",
                self.name
            )));
        }
        if self.success_threshold < 1 {
            return Err(Error::Config(format!(
                "Breaker '{}': success_threshold must be at least 1",
                self.name
            )));
        }
        for (field, value) in [
            ("recovery_timeout_seconds", self.recovery_timeout_seconds),
            ("call_timeout_seconds", self.call_timeout_seconds),
            (
                "slow_call_threshold_seconds",
                self.slow_call_threshold_seconds,
            ),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Config(format!(
                    "Breaker '{}': {field} must be positive",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Counters owned by one breaker, mutated only under its lock.
#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    slow_requests: u64,
    state_changes: u64,
    last_failure_time: Option<f64>,
    last_success_time: Option<f64>,
    latencies: VecDeque<f64>,
}

/// Everything guarded by the breaker's mutex.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_attempt: Option<Instant>,
    counters: Counters,
}

/// Point-in-time view of a breaker's counters and derived figures.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStatsSnapshot {
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub slow_requests: u64,
    pub state_changes: u64,
    /// Epoch seconds of the most recent counted failure.
    pub last_failure_time: Option<f64>,
    /// Epoch seconds of the most recent success.
    pub last_success_time: Option<f64>,
    /// successful / (successful + failed); 1.0 when no calls completed.
    pub success_rate: f64,
    /// Mean of the most recent completed-call latencies.
    pub average_latency_seconds: f64,
}

/// Three-state failure isolator around an async dependency.
///
/// The internal lock is never held across `.await`; admission and
/// outcome recording are separate critical sections, and the wrapped
/// call runs between them.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker from a validated config.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                next_attempt: None,
                counters: Counters::default(),
            }),
        })
    }

    /// The breaker's name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The breaker's policy.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current position in the state machine.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Execute `f` under the breaker with every error counted as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.call_filtered(f, |_| true).await
    }

    /// Execute `f` under the breaker, counting only errors accepted by
    /// `counts_as_failure`.
    ///
    /// Errors the predicate rejects pass through unchanged and do not
    /// move the state machine.
    pub async fn call_filtered<F, Fut, T, E, P>(
        &self,
        f: F,
        counts_as_failure: P,
    ) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        if let Err(retry_after) = self.try_admit() {
            debug!(
                breaker = %self.config.name,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rejecting call while circuit is open"
            );
            return Err(BreakerError::Open {
                name: self.config.name.clone(),
                retry_after,
            });
        }

        let timeout = Duration::from_secs_f64(self.config.call_timeout_seconds);
        let start = Instant::now();
        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => {
                self.on_success(start.elapsed());
                Ok(value)
            }
            Ok(Err(e)) => {
                if counts_as_failure(&e) {
                    self.on_failure(Some(start.elapsed()));
                } else {
                    debug!(
                        breaker = %self.config.name,
                        "Error excluded from failure accounting"
                    );
                }
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                let elapsed = start.elapsed();
                self.on_failure(Some(elapsed));
                Err(BreakerError::Timeout {
                    name: self.config.name.clone(),
                    elapsed,
                })
            }
        }
    }

    /// Execute `f` under the breaker, awaiting `fallback` instead when the
    /// call is rejected, times out, or fails.
    ///
    /// The fallback's own output, success or error, propagates unmodified.
    /// While the circuit is open the wrapped function is never invoked.
    pub async fn call_with_fallback<F, Fut, FB, FutB, T, E>(
        &self,
        f: F,
        fallback: FB,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        FB: FnOnce() -> FutB,
        FutB: Future<Output = std::result::Result<T, E>>,
    {
        match self.call(f).await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(
                    breaker = %self.config.name,
                    open = e.is_open(),
                    timeout = e.is_timeout(),
                    "Falling back after breaker-guarded call failed"
                );
                fallback().await
            }
        }
    }

    /// Administrative force to Closed with counters cleared.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        self.transition(&mut st, CircuitState::Closed);
        st.consecutive_failures = 0;
        st.consecutive_successes = 0;
        st.next_attempt = None;
        info!(breaker = %self.config.name, "Circuit breaker reset");
    }

    /// Snapshot counters and derived figures.
    pub fn stats(&self) -> CircuitBreakerStatsSnapshot {
        let st = self.state.lock();
        let c = &st.counters;
        let completed = c.successful_requests + c.failed_requests;
        CircuitBreakerStatsSnapshot {
            state: st.state,
            total_requests: c.total_requests,
            successful_requests: c.successful_requests,
            failed_requests: c.failed_requests,
            rejected_requests: c.rejected_requests,
            slow_requests: c.slow_requests,
            state_changes: c.state_changes,
            last_failure_time: c.last_failure_time,
            last_success_time: c.last_success_time,
            success_rate: if completed > 0 {
                c.successful_requests as f64 / completed as f64
            } else {
                1.0
            },
            average_latency_seconds: if c.latencies.is_empty() {
                0.0
            } else {
                c.latencies.iter().sum::<f64>() / c.latencies.len() as f64
            },
        }
    }

    /// Decide whether a call may proceed, flipping Open to HalfOpen once
    /// the recovery timeout has elapsed. Returns the remaining open time
    /// on rejection.
    fn try_admit(&self) -> std::result::Result<(), Duration> {
        let mut st = self.state.lock();
        st.counters.total_requests += 1;
        match st.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                match st.next_attempt {
                    Some(at) if now < at => {
                        st.counters.rejected_requests += 1;
                        Err(at - now)
                    }
                    _ => {
                        self.transition(&mut st, CircuitState::HalfOpen);
                        Ok(())
                    }
                }
            }
        }
    }

    fn on_success(&self, latency: Duration) {
        let mut st = self.state.lock();
        st.counters.successful_requests += 1;
        st.counters.last_success_time = Some(now_epoch_secs());
        self.observe_latency(&mut st, latency);
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                st.consecutive_successes += 1;
                if st.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut st, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, latency: Option<Duration>) {
        let mut st = self.state.lock();
        st.counters.failed_requests += 1;
        st.counters.last_failure_time = Some(now_epoch_secs());
        if let Some(latency) = latency {
            self.observe_latency(&mut st, latency);
        }
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures += 1;
                if st.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut st, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut st, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn observe_latency(&self, st: &mut BreakerState, latency: Duration) {
        let secs = latency.as_secs_f64();
        if st.counters.latencies.len() == LATENCY_RING_CAPACITY {
            st.counters.latencies.pop_front();
        }
        st.counters.latencies.push_back(secs);
        if secs > self.config.slow_call_threshold_seconds {
            st.counters.slow_requests += 1;
            warn!(
                breaker = %self.config.name,
                latency_seconds = secs,
                threshold_seconds = self.config.slow_call_threshold_seconds,
                "Slow call detected"
            );
        }
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        st.counters.state_changes += 1;
        match to {
            CircuitState::Open => {
                st.next_attempt = Some(
                    Instant::now()
                        + Duration::from_secs_f64(self.config.recovery_timeout_seconds),
                );
                st.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                st.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                st.consecutive_failures = 0;
                st.consecutive_successes = 0;
                st.next_attempt = None;
            }
        }
        info!(
            breaker = %self.config.name,
            from = ?from,
            to = ?to,
            "Circuit breaker state change"
        );
    }
}

fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
