//! Retry primitives: exponential backoff with jitter and a circuit breaker.
//!
//! Every outbound hub call goes through this layer. Backoff smooths
//! short-lived failures; the breaker fails fast during sustained outages
//! so callers stop hammering a dead endpoint.

mod backoff;
mod breaker;

pub use backoff::{Backoff, BackoffConfig};
pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
