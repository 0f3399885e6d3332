//! Event emission for monitoring collaborators.
//!
//! The wrapper and registry report decisions and state changes through an
//! [`EventSink`] held by the pipeline context.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by flowguard.
pub mod event_types {
    /// An item is about to be retried.
    pub const ITEM_RETRY: &str = "node.item_retry";
    /// An item was dropped after a `Skip` decision.
    pub const ITEM_SKIPPED: &str = "node.item_skipped";
    /// An item was forwarded to the dead-letter sink.
    pub const ITEM_DEAD_LETTERED: &str = "node.item_dead_lettered";
    /// The parallel queue dropped an item.
    pub const ITEM_DROPPED: &str = "node.item_dropped";
    /// A node is being restarted from its replay buffer.
    pub const NODE_RESTART: &str = "node.restart";
    /// A node's remaining output was abandoned.
    pub const NODE_CONTINUE_WITHOUT: &str = "node.continue_without_node";
    /// A node failed terminally.
    pub const NODE_FAILED: &str = "node.failed";
    /// A node's stream completed.
    pub const NODE_COMPLETED: &str = "node.completed";
    /// A circuit breaker refused execution.
    pub const CIRCUIT_REJECTED: &str = "circuit_breaker.rejected";
    /// A breaker was dropped from the registry.
    pub const CIRCUIT_EVICTED: &str = "circuit_breaker.evicted";
}
