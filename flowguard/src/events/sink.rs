//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Receives resilience events for monitoring collaborators.
///
/// Sinks are carried by the pipeline context; there is no process-wide sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "node.restart")
    /// * `data` - Optional event data
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without blocking. Must never fail.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// Discards all events. Default sink of a pipeline context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    ///
    /// Levels other than `DEBUG` log at `INFO`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&serde_json::Value>) {
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = ?data, "Resilience event");
        } else {
            info!(event_type = %event_type, event_data = ?data, "Resilience event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Keeps every event in memory. Intended for tests and inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Counts events of exactly `event_type`.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .count()
    }

    /// Returns events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit("node.restart", None).await;
        NoOpEventSink.try_emit("node.restart", Some(serde_json::json!({"x": 1})));

        let sink = LoggingEventSink::debug();
        sink.emit("node.restart", Some(serde_json::json!({"node_id": "a"}))).await;
        sink.try_emit("node.completed", None);
    }

    #[test]
    fn test_collecting_sink_filters() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        tokio_test::block_on(sink.emit("node.item_retry", None));
        sink.try_emit("node.item_retry", None);
        sink.try_emit("circuit_breaker.rejected", None);

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.count("node.item_retry"), 2);
        assert_eq!(sink.events_of_type("circuit_breaker.").len(), 1);
        assert_eq!(sink.events()[2].0, "circuit_breaker.rejected");
    }
}
