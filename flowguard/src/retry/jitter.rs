//! Jitter applied on top of a backoff value.

use crate::errors::ConfigurationError;
use crate::utils::ensure_multiplier;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter strategy to desynchronize concurrent retries.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JitterStrategy {
    /// d
    None,
    /// uniform(0, d)
    #[default]
    Full,
    /// d/2 + uniform(0, d/2)
    Equal,
    /// uniform(base, min(max, previous * multiplier))
    Decorrelated {
        /// Growth factor applied to the previous delay.
        multiplier: f64,
    },
}

impl JitterStrategy {
    /// Validates the jitter parameters.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match *self {
            Self::Decorrelated { multiplier } => {
                ensure_multiplier("jitter.multiplier", multiplier)
            }
            Self::None | Self::Full | Self::Equal => Ok(()),
        }
    }
}

/// Random source and decorrelation memory of one retry sequence.
#[derive(Debug, Clone)]
pub(crate) struct JitterState {
    pub(crate) rng: StdRng,
    pub(crate) previous: Option<Duration>,
}

impl JitterState {
    pub(crate) fn new(rng: StdRng) -> Self {
        Self {
            rng,
            previous: None,
        }
    }

    /// Applies `jitter` to the backoff value `delay`.
    pub(crate) fn apply(
        &mut self,
        jitter: JitterStrategy,
        delay: Duration,
        base: Duration,
        max_delay: Duration,
    ) -> Duration {
        let jittered = match jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => self.uniform(Duration::ZERO, delay),
            JitterStrategy::Equal => {
                let half = delay / 2;
                half + self.uniform(Duration::ZERO, delay - half)
            }
            JitterStrategy::Decorrelated { multiplier } => {
                let floor = base.min(max_delay);
                let previous = self.previous.unwrap_or(floor);
                let grown = previous.as_secs_f64() * multiplier;
                let ceiling = if grown.is_finite() && grown < max_delay.as_secs_f64() {
                    Duration::from_secs_f64(grown.max(0.0))
                } else {
                    max_delay
                };
                let next = self.uniform(floor, ceiling);
                self.previous = Some(next);
                next
            }
        };
        jittered.min(max_delay)
    }

    fn uniform(&mut self, low: Duration, high: Duration) -> Duration {
        let low_nanos = u64::try_from(low.as_nanos()).unwrap_or(u64::MAX);
        let high_nanos = u64::try_from(high.as_nanos()).unwrap_or(u64::MAX);
        if high_nanos <= low_nanos {
            return low;
        }
        Duration::from_nanos(self.rng.gen_range(low_nanos..=high_nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn state() -> JitterState {
        JitterState::new(StdRng::seed_from_u64(7))
    }

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(10);

    #[test]
    fn test_no_jitter() {
        let delay = Duration::from_secs(3);
        assert_eq!(state().apply(JitterStrategy::None, delay, BASE, MAX), delay);
    }

    #[test]
    fn test_full_jitter_bounds() {
        let mut s = state();
        let delay = Duration::from_secs(2);
        for _ in 0..200 {
            assert!(s.apply(JitterStrategy::Full, delay, BASE, MAX) <= delay);
        }
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let mut s = state();
        let delay = Duration::from_secs(2);
        for _ in 0..200 {
            let d = s.apply(JitterStrategy::Equal, delay, BASE, MAX);
            assert!(d >= Duration::from_secs(1) && d <= delay);
        }
    }

    #[test]
    fn test_decorrelated_stays_in_range() {
        let mut s = state();
        let jitter = JitterStrategy::Decorrelated { multiplier: 3.0 };
        let mut previous = BASE;
        for _ in 0..100 {
            let d = s.apply(jitter, BASE, BASE, MAX);
            let ceiling = Duration::from_secs_f64(previous.as_secs_f64() * 3.0).min(MAX);
            assert!(d >= BASE && d <= ceiling, "{d:?} outside [{BASE:?}, {ceiling:?}]");
            previous = d;
        }
    }

    #[test]
    fn test_zero_delay_is_zero() {
        let mut s = state();
        assert_eq!(s.apply(JitterStrategy::Full, Duration::ZERO, BASE, MAX), Duration::ZERO);
        assert_eq!(s.apply(JitterStrategy::Equal, Duration::ZERO, BASE, MAX), Duration::ZERO);
    }

    #[test]
    fn test_validate() {
        assert!(JitterStrategy::Decorrelated { multiplier: 0.9 }.validate().is_err());
        assert!(JitterStrategy::Decorrelated { multiplier: 3.0 }.validate().is_ok());
    }
}
