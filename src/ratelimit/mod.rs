//! Rate limiting rules, algorithms, and the limiter front end.

mod algorithm;
mod limiter;
mod rule;

pub use algorithm::TokenBucketState;
pub use limiter::{RateLimiter, RateLimiterStats};
pub use rule::{Algorithm, RateLimitResult, RateLimitRule, Scope};
