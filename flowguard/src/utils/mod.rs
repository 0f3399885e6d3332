//! Shared helpers for configuration handling.

pub mod duration_ms;
mod validation;

pub use validation::{ensure_multiplier, ensure_positive, ensure_ratio};
