//! Circuit breaker configuration.

use crate::errors::ConfigurationError;
use crate::utils::{duration_ms, ensure_positive, ensure_ratio};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How failures are counted against `failure_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    /// Consecutive failures, reset by any success.
    #[default]
    ConsecutiveFailures,
    /// Failures within the sampling window.
    RollingWindowCount,
    /// Failure rate within the sampling window, with `failure_threshold`
    /// as the minimum number of operations.
    RollingWindowRate,
    /// Either the window count or the window rate condition.
    Hybrid,
}

impl ThresholdType {
    /// Returns true when the failure rate is evaluated.
    #[must_use]
    pub fn uses_rate(self) -> bool {
        matches!(self, Self::RollingWindowRate | Self::Hybrid)
    }

    /// Returns true when the sampling window is evaluated.
    #[must_use]
    pub fn uses_window(self) -> bool {
        !matches!(self, Self::ConsecutiveFailures)
    }
}

/// Configuration for one node's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures (or minimum operations for rate thresholds) that trip the breaker.
    pub failure_threshold: usize,
    /// Time spent Open before a trial is allowed.
    #[serde(rename = "open_duration_ms", with = "duration_ms")]
    pub open_duration: Duration,
    /// Age limit of window records.
    #[serde(rename = "sampling_window_ms", with = "duration_ms")]
    pub sampling_window: Duration,
    /// A disabled breaker always allows and records nothing.
    pub enabled: bool,
    /// Threshold evaluation mode.
    pub threshold_type: ThresholdType,
    /// Failure ratio in `[0, 1]`; only read for rate-based thresholds.
    pub failure_rate_threshold: f64,
    /// Consecutive half-open successes that close the breaker.
    pub half_open_success_threshold: usize,
    /// Trials admitted per half-open period.
    pub half_open_max_attempts: usize,
    /// Record successes in the window even for count-only thresholds.
    pub track_operations_in_window: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
            sampling_window: Duration::from_secs(300),
            enabled: true,
            threshold_type: ThresholdType::ConsecutiveFailures,
            failure_rate_threshold: 0.5,
            half_open_success_threshold: 1,
            half_open_max_attempts: 5,
            track_operations_in_window: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips after `threshold` consecutive failures.
    #[must_use]
    pub fn consecutive(threshold: usize, open_duration: Duration) -> Self {
        Self {
            failure_threshold: threshold,
            open_duration,
            ..Self::default()
        }
    }

    /// Trips after `threshold` failures inside `window`.
    #[must_use]
    pub fn rolling_count(threshold: usize, window: Duration, open_duration: Duration) -> Self {
        Self {
            failure_threshold: threshold,
            sampling_window: window,
            open_duration,
            threshold_type: ThresholdType::RollingWindowCount,
            ..Self::default()
        }
    }

    /// Trips once `min_operations` have been seen inside `window` and the
    /// failure ratio reaches `rate`.
    #[must_use]
    pub fn rolling_rate(
        min_operations: usize,
        rate: f64,
        window: Duration,
        open_duration: Duration,
    ) -> Self {
        Self {
            failure_threshold: min_operations,
            failure_rate_threshold: rate,
            sampling_window: window,
            open_duration,
            threshold_type: ThresholdType::RollingWindowRate,
            ..Self::default()
        }
    }

    /// Trips on either the count or the rate condition.
    #[must_use]
    pub fn hybrid(threshold: usize, rate: f64, window: Duration, open_duration: Duration) -> Self {
        Self {
            threshold_type: ThresholdType::Hybrid,
            ..Self::rolling_rate(threshold, rate, window, open_duration)
        }
    }

    /// A breaker that never trips.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the half-open success threshold.
    #[must_use]
    pub fn with_half_open_success_threshold(mut self, successes: usize) -> Self {
        self.half_open_success_threshold = successes;
        self
    }

    /// Sets the half-open trial budget.
    #[must_use]
    pub fn with_half_open_max_attempts(mut self, attempts: usize) -> Self {
        self.half_open_max_attempts = attempts;
        self
    }

    /// Sets whether successes are kept in the window.
    #[must_use]
    pub fn with_track_operations_in_window(mut self, track: bool) -> Self {
        self.track_operations_in_window = track;
        self
    }

    /// Returns true when successes are stored in the window.
    #[must_use]
    pub fn records_successes(&self) -> bool {
        self.track_operations_in_window || self.threshold_type.uses_rate()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        ensure_positive("failure_threshold", self.failure_threshold)?;
        ensure_positive("half_open_success_threshold", self.half_open_success_threshold)?;
        ensure_positive("half_open_max_attempts", self.half_open_max_attempts)?;
        if self.half_open_max_attempts < self.half_open_success_threshold {
            return Err(ConfigurationError::invalid(
                "half_open_max_attempts",
                "must be at least half_open_success_threshold",
            ));
        }
        if self.threshold_type.uses_rate() {
            ensure_ratio("failure_rate_threshold", self.failure_rate_threshold)?;
        }
        if self.threshold_type.uses_window() && self.sampling_window.is_zero() {
            return Err(ConfigurationError::invalid(
                "sampling_window_ms",
                "must be greater than zero for window-based thresholds",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CircuitBreakerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.threshold_type, ThresholdType::ConsecutiveFailures);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rate_outside_unit_interval_rejected() {
        let config =
            CircuitBreakerConfig::rolling_rate(10, 1.5, Duration::from_secs(60), Duration::from_secs(5));
        assert!(config.validate().is_err());

        // Ignored when the threshold type does not read it.
        let config = CircuitBreakerConfig {
            failure_rate_threshold: 7.0,
            ..CircuitBreakerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = CircuitBreakerConfig::consecutive(0, Duration::from_secs(1));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn test_half_open_budget_must_cover_successes() {
        let config = CircuitBreakerConfig::default()
            .with_half_open_success_threshold(3)
            .with_half_open_max_attempts(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_records_successes() {
        let config = CircuitBreakerConfig::rolling_count(3, Duration::from_secs(1), Duration::from_secs(1))
            .with_track_operations_in_window(false);
        assert!(!config.records_successes());

        let config =
            CircuitBreakerConfig::hybrid(3, 0.5, Duration::from_secs(1), Duration::from_secs(1))
                .with_track_operations_in_window(false);
        assert!(config.records_successes());
    }

    #[test]
    fn test_from_json() {
        let config = CircuitBreakerConfig::from_json(
            r#"{"failure_threshold": 10, "threshold_type": "rolling_window_rate",
                "failure_rate_threshold": 0.3, "sampling_window_ms": 60000}"#,
        )
        .unwrap();
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.threshold_type, ThresholdType::RollingWindowRate);
        assert_eq!(config.sampling_window, Duration::from_secs(60));
        assert_eq!(config.open_duration, Duration::from_secs(60));
    }
}
