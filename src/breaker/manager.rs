//! Named circuit breaker registry and aggregate health reporting.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use super::breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatsSnapshot, CircuitState,
};
use crate::error::Result;

/// Aggregate health verdict across all registered breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Every breaker is closed.
    Healthy,
    /// At least one breaker is probing recovery.
    Degraded,
    /// At least one breaker is open.
    Unhealthy,
}

/// Per-breaker states plus the aggregate verdict.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub overall: Health,
    pub breakers: HashMap<String, CircuitState>,
}

/// Registry of named breakers, shared across the host's call sites.
#[derive(Default)]
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker, or return the existing instance for the name.
    ///
    /// Duplicate registration is a caller bug but not a fatal one; the
    /// existing breaker is returned and a warning is logged.
    pub fn create(&self, config: CircuitBreakerConfig) -> Result<Arc<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(&config.name) {
            warn!(
                breaker = %config.name,
                "Circuit breaker already registered, returning existing instance"
            );
            return Ok(Arc::clone(existing.value()));
        }
        let name = config.name.clone();
        let breaker = Arc::new(CircuitBreaker::new(config)?);
        let entry = self
            .breakers
            .entry(name.clone())
            .or_insert_with(|| Arc::clone(&breaker));
        info!(breaker = %name, "Registered circuit breaker");
        Ok(Arc::clone(entry.value()))
    }

    /// Fetch a registered breaker by name.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Names of all registered breakers.
    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breakers are registered.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshot every breaker's stats, keyed by name.
    pub fn get_all_stats(&self) -> HashMap<String, CircuitBreakerStatsSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Report per-breaker states and an aggregate verdict.
    ///
    /// Severity ordering: any open breaker makes the aggregate unhealthy;
    /// otherwise any half-open breaker makes it degraded.
    pub fn health_check_all(&self) -> HealthReport {
        let breakers: HashMap<String, CircuitState> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        let overall = if breakers.values().any(|s| *s == CircuitState::Open) {
            Health::Unhealthy
        } else if breakers.values().any(|s| *s == CircuitState::HalfOpen) {
            Health::Degraded
        } else {
            Health::Healthy
        };
        HealthReport { overall, breakers }
    }

    /// Force every breaker to Closed. Operational escape hatch, never
    /// invoked automatically.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        info!(count = self.breakers.len(), "Reset all circuit breakers");
    }
}
