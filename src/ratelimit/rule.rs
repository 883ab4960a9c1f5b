//! Rate limit rule definitions.
//!
//! Rules are immutable policy: created at configuration time, validated
//! before registration, and replaced whole under their name when policy
//! changes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Admission algorithm selector for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Burst-tolerant bucket refilled at a constant rate.
    TokenBucket,
    /// Exact request timestamps over a continuously moving interval.
    SlidingWindow,
    /// Discrete window counters; cheapest, with a boundary double-burst
    /// artifact of up to twice the nominal rate at a window edge.
    FixedWindow,
}

/// What an identifier represents, used only to derive storage keys so
/// that the same identifier string never collides across scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    PerUser,
    PerIp,
    PerEndpoint,
    PerApiKey,
}

impl Scope {
    /// Stable key-segment spelling for this scope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::PerUser => "per_user",
            Scope::PerIp => "per_ip",
            Scope::PerEndpoint => "per_endpoint",
            Scope::PerApiKey => "per_api_key",
        }
    }
}

/// A named rate limit policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Unique rule name; registering a rule with an existing name replaces it.
    pub name: String,
    /// Requests allowed per window.
    pub requests: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
    /// Admission algorithm.
    pub algorithm: Algorithm,
    /// Key-derivation scope.
    pub scope: Scope,
    /// Token-bucket capacity = requests x burst_multiplier.
    #[serde(default = "default_burst_multiplier")]
    pub burst_multiplier: f64,
    /// Reserved; no algorithm currently consults it.
    #[serde(default)]
    pub grace_period_seconds: u64,
    /// Disabled rules admit everything.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_burst_multiplier() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    /// Check the rule's fields for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("Rate limit rule has an empty name".to_string()));
        }
        if self.requests < 1 {
            return Err(Error::Config(format!(
                "Rule '{}': requests must be at least 1",
                self.name
            )));
        }
        if self.window_seconds < 1 {
            return Err(Error::Config(format!(
                "Rule '{}': window_seconds must be at least 1",
                self.name
            )));
        }
        if !self.burst_multiplier.is_finite() || self.burst_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "Rule '{}': burst_multiplier must be at least 1.0",
                self.name
            )));
        }
        Ok(())
    }

    /// Token-bucket capacity for this rule.
    pub fn capacity(&self) -> u32 {
        (f64::from(self.requests) * self.burst_multiplier).round() as u32
    }

    /// Token-bucket refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.requests) / self.window_seconds as f64
    }
}

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Quota remaining in the current window or bucket.
    pub remaining: u32,
    /// Epoch seconds at which the quota fully resets.
    pub reset_time: u64,
    /// Seconds to wait before retrying; set only on rejection.
    pub retry_after: Option<u64>,
    /// Usage observed in the current window or bucket.
    pub current_usage: u32,
    /// Name of the rule that produced this result.
    pub rule_name: String,
}

impl RateLimitResult {
    /// An unconditional allow, used when no policy applies.
    pub fn allow_unlimited(rule_name: &str) -> Self {
        Self {
            allowed: true,
            remaining: 0,
            reset_time: 0,
            retry_after: None,
            current_usage: 0,
            rule_name: rule_name.to_string(),
        }
    }
}
