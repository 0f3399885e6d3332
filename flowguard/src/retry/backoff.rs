//! Backoff curves: the un-jittered delay for a given retry attempt.

use crate::errors::ConfigurationError;
use crate::utils::{duration_ms, ensure_multiplier};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
///
/// Attempts are zero-based: attempt `0` is the delay before the first retry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = d
    Fixed {
        /// Constant delay.
        #[serde(rename = "delay_ms", with = "duration_ms")]
        delay: Duration,
    },
    /// delay = base + increment * attempt
    Linear {
        /// Delay for attempt 0.
        #[serde(rename = "base_ms", with = "duration_ms")]
        base: Duration,
        /// Added per attempt.
        #[serde(rename = "increment_ms", with = "duration_ms")]
        increment: Duration,
    },
    /// delay = base * multiplier^attempt
    Exponential {
        /// Delay for attempt 0.
        #[serde(rename = "base_ms", with = "duration_ms")]
        base: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Returns the delay for attempt 0, used as the decorrelated jitter floor.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Linear { base, .. } | Self::Exponential { base, .. } => base,
        }
    }

    /// Calculates the delay for `attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay(&self, attempt: u32, max_delay: Duration) -> Duration {
        let raw = match *self {
            Self::Fixed { delay } => delay,
            Self::Linear { base, increment } => {
                base.saturating_add(increment.saturating_mul(attempt))
            }
            Self::Exponential { base, multiplier } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let secs = base.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
                    return max_delay;
                }
                Duration::from_secs_f64(secs.max(0.0))
            }
        };
        raw.min(max_delay)
    }

    /// Validates the curve parameters.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match *self {
            Self::Exponential { multiplier, .. } => {
                ensure_multiplier("backoff.multiplier", multiplier)
            }
            Self::Fixed { .. } | Self::Linear { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(60);

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffStrategy::Fixed {
            delay: Duration::from_millis(250),
        };
        assert_eq!(backoff.delay(0, MAX), Duration::from_millis(250));
        assert_eq!(backoff.delay(9, MAX), Duration::from_millis(250));
        assert_eq!(backoff.delay(0, Duration::from_millis(100)), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_backoff_capped() {
        let backoff = BackoffStrategy::Linear {
            base: Duration::from_secs(1),
            increment: Duration::from_secs(2),
        };
        assert_eq!(backoff.delay(0, MAX), Duration::from_secs(1));
        assert_eq!(backoff.delay(3, MAX), Duration::from_secs(7));
        assert_eq!(backoff.delay(100, MAX), MAX);
    }

    #[test]
    fn test_exponential_sequence() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            multiplier: 2.0,
        };
        let delays: Vec<u64> = (0..8).map(|a| backoff.delay(a, MAX).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_exponential_overflow_caps() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            multiplier: 10.0,
        };
        assert_eq!(backoff.delay(u32::MAX, MAX), MAX);
    }

    #[test]
    fn test_validate_multiplier() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            multiplier: 0.5,
        };
        assert!(backoff.validate().is_err());
        assert!(BackoffStrategy::default().validate().is_ok());
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::json!({"kind": "linear", "base_ms": 100, "increment_ms": 50});
        let backoff: BackoffStrategy = serde_json::from_value(json).unwrap();
        assert_eq!(
            backoff,
            BackoffStrategy::Linear {
                base: Duration::from_millis(100),
                increment: Duration::from_millis(50),
            }
        );
    }
}
