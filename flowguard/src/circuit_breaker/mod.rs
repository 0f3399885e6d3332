//! Per-node circuit breaking.
//!
//! A [`CircuitBreaker`] tracks recent outcomes of one node and refuses
//! execution once a configured failure condition holds. The
//! [`CircuitBreakerRegistry`] owns one breaker per node id and bounds how
//! many it keeps alive.

mod breaker;
mod config;
mod registry;
mod window;

pub use breaker::{CircuitBreaker, CircuitBreakerStatistics, CircuitState};
pub use config::{CircuitBreakerConfig, ThresholdType};
pub use registry::{CircuitBreakerRegistry, CircuitBreakerRegistryOptions};
