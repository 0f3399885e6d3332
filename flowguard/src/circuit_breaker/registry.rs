//! Registry of per-node circuit breakers with inactivity and LRU eviction.

use super::breaker::{CircuitBreaker, CircuitBreakerStatistics};
use super::config::CircuitBreakerConfig;
use crate::errors::ConfigurationError;
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::utils::{duration_ms, ensure_positive};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle settings of a [`CircuitBreakerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerRegistryOptions {
    /// Period of the background cleanup.
    #[serde(rename = "cleanup_interval_ms", with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Breakers idle for longer than this are removed by cleanup.
    #[serde(rename = "inactivity_threshold_ms", with = "duration_ms")]
    pub inactivity_threshold: Duration,
    /// Above this many breakers the least recently used one is evicted.
    pub max_tracked_breakers: usize,
    /// Whether [`CircuitBreakerRegistry::start_automatic_cleanup`] spawns a task.
    pub enable_automatic_cleanup: bool,
    /// Upper bound on the duration of one cleanup pass.
    #[serde(rename = "cleanup_timeout_ms", with = "duration_ms")]
    pub cleanup_timeout: Duration,
}

impl Default for CircuitBreakerRegistryOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(300),
            inactivity_threshold: Duration::from_secs(1800),
            max_tracked_breakers: 1000,
            enable_automatic_cleanup: true,
            cleanup_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerRegistryOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cleanup interval.
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Sets the inactivity threshold.
    #[must_use]
    pub fn with_inactivity_threshold(mut self, threshold: Duration) -> Self {
        self.inactivity_threshold = threshold;
        self
    }

    /// Sets the tracked-breaker cap.
    #[must_use]
    pub fn with_max_tracked_breakers(mut self, max: usize) -> Self {
        self.max_tracked_breakers = max;
        self
    }

    /// Enables or disables the background cleanup.
    #[must_use]
    pub fn with_automatic_cleanup(mut self, enabled: bool) -> Self {
        self.enable_automatic_cleanup = enabled;
        self
    }

    /// Sets the cleanup pass timeout.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Validates the options.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        ensure_positive("max_tracked_breakers", self.max_tracked_breakers)?;
        for (field, value) in [
            ("cleanup_interval_ms", self.cleanup_interval),
            ("inactivity_threshold_ms", self.inactivity_threshold),
            ("cleanup_timeout_ms", self.cleanup_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigurationError::invalid(field, "must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Parses options from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }
}

/// Owns every circuit breaker of a pipeline, keyed by node id.
///
/// Callers receive `Arc` handles; all state changes go through the breaker's
/// own locked API. The map is sharded so nodes do not contend with each other.
/// An evicted breaker is forgotten: the next [`get_or_create`] for that node
/// starts a fresh, closed breaker.
///
/// [`get_or_create`]: CircuitBreakerRegistry::get_or_create
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    options: CircuitBreakerRegistryOptions,
    access_clock: Arc<AtomicU64>,
    event_sink: Arc<dyn EventSink>,
    cleanup_running: AtomicBool,
    cleanup_handle: RwLock<Option<JoinHandle<()>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry after validating `options`.
    pub fn new(options: CircuitBreakerRegistryOptions) -> Result<Self, ConfigurationError> {
        options.validate()?;
        Ok(Self::with_valid_options(options))
    }

    fn with_valid_options(options: CircuitBreakerRegistryOptions) -> Self {
        Self {
            breakers: DashMap::new(),
            options,
            access_clock: Arc::new(AtomicU64::new(0)),
            event_sink: Arc::new(NoOpEventSink),
            cleanup_running: AtomicBool::new(false),
            cleanup_handle: RwLock::new(None),
        }
    }

    /// Sets the sink receiving eviction events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Returns the options.
    #[must_use]
    pub fn options(&self) -> &CircuitBreakerRegistryOptions {
        &self.options
    }

    /// Returns the breaker for `node_id`, creating it with `config` if absent.
    ///
    /// An existing breaker keeps the configuration it was created with.
    pub fn get_or_create(&self, node_id: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(node_id) {
            existing.mark_accessed();
            return existing;
        }

        let (breaker, inserted) = match self.breakers.entry(node_id.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let breaker = Arc::new(CircuitBreaker::with_access_clock(
                    node_id,
                    config,
                    Arc::clone(&self.access_clock),
                ));
                entry.insert(Arc::clone(&breaker));
                (breaker, true)
            }
        };

        if inserted {
            debug!(node_id = %node_id, tracked = self.breakers.len(), "Circuit breaker created");
            self.enforce_capacity(node_id);
        } else {
            breaker.mark_accessed();
        }
        breaker
    }

    /// Returns the breaker for `node_id` if tracked.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(node_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Stops tracking `node_id`.
    pub fn remove(&self, node_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(node_id).map(|(_, breaker)| breaker)
    }

    /// Returns the number of tracked breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Returns statistics of every tracked breaker, ordered by node id.
    #[must_use]
    pub fn statistics(&self) -> Vec<CircuitBreakerStatistics> {
        let breakers: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut stats: Vec<_> = breakers.iter().map(|b| b.statistics()).collect();
        stats.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        stats
    }

    /// Removes breakers idle for longer than the inactivity threshold.
    ///
    /// Stops early once the pass exceeds `cleanup_timeout`; the remaining
    /// candidates are picked up by the next pass. Returns the eviction count.
    pub fn cleanup(&self) -> usize {
        let deadline = Instant::now() + self.options.cleanup_timeout;
        self.cleanup_until(deadline, Instant::now)
    }

    /// One cleanup pass that stops once `clock` reaches `deadline`.
    ///
    /// The clock is read before each eviction.
    pub(crate) fn cleanup_until(&self, deadline: Instant, mut clock: impl FnMut() -> Instant) -> usize {
        let threshold = self.options.inactivity_threshold;

        let candidates: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().last_accessed().elapsed() > threshold)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for node_id in candidates {
            if clock() >= deadline {
                warn!(
                    evicted,
                    timeout_ms = self.options.cleanup_timeout.as_millis() as u64,
                    "Circuit breaker cleanup timed out"
                );
                break;
            }
            // Re-check under the shard lock; the breaker may have been used since the scan.
            let removed = self
                .breakers
                .remove_if(&node_id, |_, breaker| breaker.last_accessed().elapsed() > threshold);
            if removed.is_some() {
                evicted += 1;
                self.report_eviction(&node_id, "inactive");
            }
        }

        if evicted > 0 {
            info!(evicted, tracked = self.breakers.len(), "Circuit breaker cleanup completed");
        }
        evicted
    }

    /// Spawns the periodic cleanup task on the current tokio runtime.
    ///
    /// Returns false when automatic cleanup is disabled, already running, or
    /// no runtime is available. The task holds a weak reference and stops
    /// once the registry is dropped.
    pub fn start_automatic_cleanup(self: &Arc<Self>) -> bool {
        if !self.options.enable_automatic_cleanup {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime available, circuit breaker cleanup not started");
            return false;
        };
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.options.cleanup_interval;
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.cleanup();
            }
        });

        *self.cleanup_handle.write() = Some(handle);
        debug!(interval_ms = period.as_millis() as u64, "Circuit breaker cleanup started");
        true
    }

    /// Stops the periodic cleanup task.
    pub fn stop_automatic_cleanup(&self) {
        if !self.cleanup_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.cleanup_handle.write().take() {
            handle.abort();
        }
    }

    /// Returns whether the periodic cleanup task is running.
    #[must_use]
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup_running.load(Ordering::Relaxed)
    }

    /// Stops the cleanup task and drops every tracked breaker.
    ///
    /// Handles already given out keep working but are no longer tracked.
    pub fn shutdown(&self) {
        self.stop_automatic_cleanup();
        let tracked = self.breakers.len();
        self.breakers.clear();
        debug!(tracked, "Circuit breaker registry shut down");
    }

    fn enforce_capacity(&self, keep: &str) {
        while self.breakers.len() > self.options.max_tracked_breakers {
            let victim = self
                .breakers
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.value().last_access_seq())
                .map(|entry| entry.key().clone());
            let Some(victim) = victim else {
                break;
            };
            if self.breakers.remove(&victim).is_some() {
                self.report_eviction(&victim, "capacity");
            }
        }
    }

    fn report_eviction(&self, node_id: &str, reason: &str) {
        debug!(node_id = %node_id, reason, "Circuit breaker evicted");
        self.event_sink.try_emit(
            event_types::CIRCUIT_EVICTED,
            Some(serde_json::json!({
                "node_id": node_id,
                "reason": reason,
                "tracked": self.breakers.len(),
            })),
        );
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::with_valid_options(CircuitBreakerRegistryOptions::default())
    }
}

impl Drop for CircuitBreakerRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("tracked", &self.breakers.len())
            .field("options", &self.options)
            .finish()
    }
}
