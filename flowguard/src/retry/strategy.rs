//! Retry delay strategy: a backoff curve composed with jitter.

use super::backoff::BackoffStrategy;
use super::jitter::{JitterState, JitterStrategy};
use crate::errors::ConfigurationError;
use crate::utils::duration_ms;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serializable description of a retry delay strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryDelayConfig {
    /// Backoff curve.
    pub backoff: BackoffStrategy,
    /// Jitter applied to the backoff value.
    pub jitter: JitterStrategy,
    /// Upper bound of every delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Seed for the jitter source; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for RetryDelayConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
            max_delay: Duration::from_secs(60),
            seed: None,
        }
    }
}

impl RetryDelayConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the backoff curve.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Fixes the jitter seed, making delays reproducible.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.backoff.validate()?;
        self.jitter.validate()?;
        if self.backoff.base_delay() > self.max_delay {
            return Err(ConfigurationError::invalid(
                "max_delay_ms",
                "must not be smaller than the base delay",
            ));
        }
        Ok(())
    }

    /// Parses a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Computes retry delays for one retry sequence.
///
/// Backoff is a pure function of the attempt. Jitter draws from a seeded
/// source and, for decorrelated jitter, remembers the previous result, so a
/// strategy instance belongs to one sequence. Use [`RetryDelayStrategy::fork`]
/// to start an independent sequence.
#[derive(Debug)]
pub struct RetryDelayStrategy {
    config: RetryDelayConfig,
    state: Mutex<JitterState>,
}

impl RetryDelayStrategy {
    /// Creates a strategy from a validated configuration.
    pub fn new(config: RetryDelayConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            state: Mutex::new(JitterState::new(rng)),
        })
    }

    /// Constant delay, no jitter.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self::unchecked(RetryDelayConfig {
            backoff: BackoffStrategy::Fixed { delay },
            jitter: JitterStrategy::None,
            max_delay: delay,
            seed: None,
        })
    }

    /// Linear backoff capped at `max_delay`, no jitter.
    ///
    /// Fails when `max_delay` is smaller than `base`.
    pub fn linear(base: Duration, increment: Duration, max_delay: Duration) -> Result<Self, ConfigurationError> {
        Self::new(RetryDelayConfig {
            backoff: BackoffStrategy::Linear { base, increment },
            jitter: JitterStrategy::None,
            max_delay,
            seed: None,
        })
    }

    /// Exponential backoff capped at `max_delay`, no jitter.
    ///
    /// Fails on a multiplier below 1.0 or a `max_delay` smaller than `base`.
    pub fn exponential(base: Duration, multiplier: f64, max_delay: Duration) -> Result<Self, ConfigurationError> {
        Self::new(RetryDelayConfig {
            backoff: BackoffStrategy::Exponential { base, multiplier },
            jitter: JitterStrategy::None,
            max_delay,
            seed: None,
        })
    }

    /// Replaces the jitter of a preset.
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Result<Self, ConfigurationError> {
        jitter.validate()?;
        self.config.jitter = jitter;
        self.state.get_mut().previous = None;
        Ok(self)
    }

    /// Reseeds the jitter source.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        *self.state.get_mut() = JitterState::new(StdRng::seed_from_u64(seed));
        self
    }

    fn unchecked(config: RetryDelayConfig) -> Self {
        Self {
            config,
            state: Mutex::new(JitterState::new(StdRng::from_entropy())),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RetryDelayConfig {
        &self.config
    }

    /// Returns the delay before retry `attempt` (zero-based), within `[0, max_delay]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_delay = self.config.max_delay;
        let backoff = self.config.backoff.delay(attempt, max_delay);
        self.state.lock().apply(
            self.config.jitter,
            backoff,
            self.config.backoff.base_delay(),
            max_delay,
        )
    }

    /// Clears decorrelation memory so the next call starts a new sequence.
    pub fn reset(&self) {
        self.state.lock().previous = None;
    }

    /// Derives an independent sequence.
    ///
    /// The child's seed is drawn from this strategy's source, so forks of a
    /// seeded strategy are reproducible.
    pub fn fork(&self) -> Self {
        let seed: u64 = self.state.lock().rng.gen();
        Self {
            config: self.config,
            state: Mutex::new(JitterState::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl Default for RetryDelayStrategy {
    fn default() -> Self {
        Self::unchecked(RetryDelayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exponential_delays_match_curve() {
        let strategy = RetryDelayStrategy::exponential(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(60),
        )
        .unwrap();
        let delays: Vec<u64> = (0..8).map(|a| strategy.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_seeded_strategy_is_deterministic() {
        let config = RetryDelayConfig::new()
            .with_jitter(JitterStrategy::Full)
            .with_seed(42);
        let a = RetryDelayStrategy::new(config).unwrap();
        let b = RetryDelayStrategy::new(config).unwrap();

        let first: Vec<Duration> = (0..6).map(|i| a.delay(i)).collect();
        let second: Vec<Duration> = (0..6).map(|i| b.delay(i)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_forks_are_reproducible_and_independent() {
        let config = RetryDelayConfig::new()
            .with_jitter(JitterStrategy::Decorrelated { multiplier: 3.0 })
            .with_seed(9);
        let parent_a = RetryDelayStrategy::new(config).unwrap();
        let parent_b = RetryDelayStrategy::new(config).unwrap();

        let fork_a = parent_a.fork();
        let fork_b = parent_b.fork();
        let seq_a: Vec<Duration> = (0..5).map(|i| fork_a.delay(i)).collect();
        let seq_b: Vec<Duration> = (0..5).map(|i| fork_b.delay(i)).collect();
        assert_eq!(seq_a, seq_b);

        // The fork's decorrelation memory is its own.
        assert!(parent_a.state.lock().previous.is_none());
    }

    #[test]
    fn test_delays_clamped_to_max() {
        let config = RetryDelayConfig::new()
            .with_backoff(BackoffStrategy::Exponential {
                base: Duration::from_millis(500),
                multiplier: 4.0,
            })
            .with_jitter(JitterStrategy::Decorrelated { multiplier: 5.0 })
            .with_max_delay(Duration::from_secs(2))
            .with_seed(1);
        let strategy = RetryDelayStrategy::new(config).unwrap();

        for attempt in 0..50 {
            assert!(strategy.delay(attempt) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let config = RetryDelayConfig::new().with_max_delay(Duration::from_millis(10));
        assert!(RetryDelayStrategy::new(config).is_err());

        let config = RetryDelayConfig::new().with_jitter(JitterStrategy::Decorrelated {
            multiplier: f64::NAN,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json() {
        let config = RetryDelayConfig::from_json(
            r#"{
                "backoff": {"kind": "exponential", "base_ms": 1000, "multiplier": 2.0},
                "jitter": {"kind": "equal"},
                "max_delay_ms": 60000,
                "seed": 3
            }"#,
        )
        .unwrap();

        assert_eq!(config.jitter, JitterStrategy::Equal);
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.seed, Some(3));
    }

    #[test]
    fn test_presets_reject_invalid_settings() {
        let err = RetryDelayStrategy::exponential(Duration::from_secs(1), 0.5, Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { ref field, .. } if field == "backoff.multiplier"));

        let err = RetryDelayStrategy::linear(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(2),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { ref field, .. } if field == "max_delay_ms"));

        let err = RetryDelayStrategy::fixed(Duration::from_millis(100))
            .with_jitter(JitterStrategy::Decorrelated { multiplier: 0.5 })
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { ref field, .. } if field == "jitter.multiplier"));
    }

    #[test]
    fn test_preset_jitter_replaced() {
        let strategy = RetryDelayStrategy::fixed(Duration::from_secs(1))
            .with_jitter(JitterStrategy::Full)
            .unwrap()
            .with_seed(5);
        assert_eq!(strategy.config().jitter, JitterStrategy::Full);
        assert!(strategy.delay(0) <= Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_preset() {
        let strategy = RetryDelayStrategy::fixed(Duration::from_millis(20));
        assert_eq!(strategy.delay(0), Duration::from_millis(20));
        assert_eq!(strategy.delay(12), Duration::from_millis(20));
    }
}
