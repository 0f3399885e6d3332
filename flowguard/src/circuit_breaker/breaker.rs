//! Per-node circuit breaker state machine.

use super::config::{CircuitBreakerConfig, ThresholdType};
use super::window::{Outcome, RollingWindow};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Executions flow normally.
    #[default]
    Closed,
    /// Executions are refused until the open duration elapses.
    Open,
    /// A limited number of trial executions is admitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Point-in-time statistics of one breaker, computed over the sampling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatistics {
    /// Node the breaker guards.
    pub node_id: String,
    /// Current state.
    pub state: CircuitState,
    /// Operations in the window.
    pub total_operations: usize,
    /// Failures in the window.
    pub failure_count: usize,
    /// Successes in the window.
    pub success_count: usize,
    /// `failure_count / total_operations`, 0 when empty.
    pub failure_rate: f64,
    /// Current run of consecutive failures.
    pub consecutive_failures: usize,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    window: RollingWindow,
    opened_at: Option<Instant>,
    half_open_successes: usize,
    half_open_attempts: usize,
    last_accessed: Instant,
}

/// Circuit breaker for one node.
///
/// Every operation takes the breaker's lock, so transitions are serialized:
/// once a failure crosses the threshold no concurrent caller can still be
/// admitted by [`CircuitBreaker::allow`].
pub struct CircuitBreaker {
    node_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    access_clock: Arc<AtomicU64>,
    last_access_seq: AtomicU64,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(node_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_access_clock(node_id, config, Arc::new(AtomicU64::new(0)))
    }

    /// Creates a breaker sharing an access counter with its registry, used
    /// to order breakers by recency.
    pub(crate) fn with_access_clock(
        node_id: impl Into<String>,
        config: CircuitBreakerConfig,
        access_clock: Arc<AtomicU64>,
    ) -> Self {
        let seq = access_clock.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            node_id: node_id.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window: RollingWindow::new(config.sampling_window),
                opened_at: None,
                half_open_successes: 0,
                half_open_attempts: 0,
                last_accessed: Instant::now(),
            }),
            config,
            access_clock,
            last_access_seq: AtomicU64::new(seq),
        }
    }

    /// Returns the guarded node id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state without side effects.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns whether an execution may proceed.
    ///
    /// An Open breaker whose open duration has elapsed moves to HalfOpen
    /// here. In HalfOpen each call consumes one trial; the call after the
    /// last trial reopens the breaker.
    pub fn allow(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.touch(&mut inner, now);
        inner.window.prune(now);

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map_or(self.config.open_duration, |at| now.saturating_duration_since(at));
            if elapsed < self.config.open_duration {
                return false;
            }
            self.transition(&mut inner, CircuitState::HalfOpen, now);
        }

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                inner.half_open_attempts += 1;
                if inner.half_open_attempts > self.config.half_open_max_attempts {
                    warn!(
                        node_id = %self.node_id,
                        attempts = inner.half_open_attempts - 1,
                        "Half-open trial budget spent without recovery"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                    false
                } else {
                    true
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Returns whether the breaker is Open and still inside its open
    /// duration. Unlike [`CircuitBreaker::allow`] this consumes no trial.
    #[must_use]
    pub fn is_rejecting(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let inner = self.inner.lock();
        inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| Instant::now().saturating_duration_since(at) < self.config.open_duration)
    }

    /// Records a successful execution.
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.touch(&mut inner, now);
        if self.config.records_successes() {
            inner.window.push(now, Outcome::Success);
        } else {
            inner.window.prune(now);
        }

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed execution.
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.touch(&mut inner, now);
        inner.window.push(now, Outcome::Failure);
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if self.threshold_exceeded(&inner) {
                    warn!(
                        node_id = %self.node_id,
                        threshold_type = ?self.config.threshold_type,
                        consecutive_failures = inner.consecutive_failures,
                        window_failures = inner.window.failures(),
                        window_total = inner.window.total(),
                        "Circuit breaker tripped"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                warn!(node_id = %self.node_id, "Trial execution failed, reopening circuit");
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Returns statistics over the current window.
    #[must_use]
    pub fn statistics(&self) -> CircuitBreakerStatistics {
        let mut inner = self.inner.lock();
        inner.window.prune(Instant::now());
        CircuitBreakerStatistics {
            node_id: self.node_id.clone(),
            state: inner.state,
            total_operations: inner.window.total(),
            failure_count: inner.window.failures(),
            success_count: inner.window.successes(),
            failure_rate: inner.window.failure_rate(),
            consecutive_failures: inner.consecutive_failures,
        }
    }

    pub(crate) fn last_accessed(&self) -> Instant {
        self.inner.lock().last_accessed
    }

    pub(crate) fn last_access_seq(&self) -> u64 {
        self.last_access_seq.load(Ordering::Relaxed)
    }

    /// Marks the breaker as used without recording an outcome.
    pub(crate) fn mark_accessed(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.touch(&mut inner, now);
    }

    fn touch(&self, inner: &mut BreakerInner, now: Instant) {
        inner.last_accessed = now;
        let seq = self.access_clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_access_seq.store(seq, Ordering::Relaxed);
    }

    fn threshold_exceeded(&self, inner: &BreakerInner) -> bool {
        let threshold = self.config.failure_threshold;
        let count_reached = || inner.window.failures() >= threshold;
        let rate_reached = || {
            inner.window.total() >= threshold
                && inner.window.failure_rate() >= self.config.failure_rate_threshold
        };
        match self.config.threshold_type {
            ThresholdType::ConsecutiveFailures => inner.consecutive_failures >= threshold,
            ThresholdType::RollingWindowCount => count_reached(),
            ThresholdType::RollingWindowRate => rate_reached(),
            ThresholdType::Hybrid => count_reached() || rate_reached(),
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
                inner.half_open_attempts = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                inner.half_open_attempts = 0;
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                inner.half_open_attempts = 0;
                // Failures from before the recovery must not re-trip the breaker.
                inner.window.clear();
            }
        }
        if to == CircuitState::Open {
            info!(node_id = %self.node_id, from = %from, to = %to, "Circuit breaker state changed");
        } else {
            debug!(node_id = %self.node_id, from = %from, to = %to, "Circuit breaker state changed");
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("node_id", &self.node_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const OPEN: Duration = Duration::from_secs(30);
    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_trips_on_nth_consecutive_failure() {
        let breaker = CircuitBreaker::new("parse", CircuitBreakerConfig::consecutive(3, OPEN));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());

        tokio::time::advance(OPEN - Duration::from_millis(1)).await;
        assert!(!breaker.allow());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("parse", CircuitBreakerConfig::consecutive(2, OPEN));

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.statistics().consecutive_failures, 1);

        // The window keeps both failures.
        assert_eq!(breaker.statistics().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_max_attempts() {
        let config = CircuitBreakerConfig::consecutive(1, OPEN)
            .with_half_open_success_threshold(2)
            .with_half_open_max_attempts(3);
        let breaker = CircuitBreaker::new("load", config);

        breaker.record_failure();
        tokio::time::advance(OPEN).await;

        let admitted = (0..3).filter(|_| breaker.allow()).count();
        assert_eq!(admitted, 3);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(!breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let config = CircuitBreakerConfig::consecutive(1, OPEN).with_half_open_success_threshold(2);
        let breaker = CircuitBreaker::new("load", config);

        breaker.record_failure();
        tokio::time::advance(OPEN).await;

        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.statistics().total_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_rejecting_consumes_no_trial() {
        let config = CircuitBreakerConfig::consecutive(1, OPEN).with_half_open_max_attempts(1);
        let breaker = CircuitBreaker::new("load", config);
        assert!(!breaker.is_rejecting());

        breaker.record_failure();
        assert!(breaker.is_rejecting());

        tokio::time::advance(OPEN).await;
        assert!(!breaker.is_rejecting());
        assert!(breaker.allow());
        for _ in 0..5 {
            assert!(!breaker.is_rejecting());
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("load", CircuitBreakerConfig::consecutive(1, OPEN));

        breaker.record_failure();
        tokio::time::advance(OPEN).await;
        assert!(breaker.allow());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_is_idempotent_when_closed_or_open() {
        let breaker = CircuitBreaker::new("sink", CircuitBreakerConfig::consecutive(2, OPEN));
        for _ in 0..10 {
            assert!(breaker.allow());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        for _ in 0..10 {
            assert!(!breaker.allow());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_rate_scenario() {
        let config = CircuitBreakerConfig::rolling_rate(10, 0.3, WINDOW, OPEN);
        let breaker = CircuitBreaker::new("score", config);

        for _ in 0..4 {
            breaker.record_success();
        }
        for _ in 0..5 {
            breaker.record_failure();
        }
        // Nine operations: below the minimum sample size.
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let stats = breaker.statistics();
        assert_eq!(stats.total_operations, 10);
        assert_eq!(stats.failure_count, 6);
        assert!((stats.failure_rate - 0.6).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_count_ignores_expired_failures() {
        let config = CircuitBreakerConfig::rolling_count(3, Duration::from_secs(10), OPEN);
        let breaker = CircuitBreaker::new("fetch", config);

        breaker.record_failure();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hybrid_trips_on_count() {
        let config = CircuitBreakerConfig::hybrid(3, 0.9, WINDOW, OPEN);
        let breaker = CircuitBreaker::new("fetch", config);

        for _ in 0..10 {
            breaker.record_success();
        }
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_breaker_never_trips() {
        let breaker = CircuitBreaker::new("noop", CircuitBreakerConfig::disabled());
        for _ in 0..100 {
            breaker.record_failure();
        }
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.statistics().total_operations, 0);
    }

    #[test]
    fn test_concurrent_failures_trip_once() {
        let breaker = Arc::new(CircuitBreaker::new(
            "shared",
            CircuitBreakerConfig::consecutive(50, OPEN),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        breaker.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
        assert_eq!(breaker.statistics().failure_count, 200);
    }
}
