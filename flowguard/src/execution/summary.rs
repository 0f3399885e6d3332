//! Per-run reporting for a node.

use crate::replay::BufferOccupancy;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How a node run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    /// Every input was consumed.
    Completed,
    /// The stream handler chose `ContinueWithoutNode`; output was cut short.
    ContinuedWithoutNode,
}

/// Counters and outcome of one node run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Node id.
    pub node_id: String,
    /// Final status.
    pub status: NodeRunStatus,
    /// Strategy name.
    pub strategy: String,
    /// Items that produced an output.
    pub items_processed: u64,
    /// Items fed again from the replay buffer.
    pub items_replayed: u64,
    /// Item retries performed.
    pub item_retries: u64,
    /// Items dropped by `Skip` or a failing dead-letter sink.
    pub items_skipped: u64,
    /// Items handed to the dead-letter sink.
    pub items_dead_lettered: u64,
    /// Items discarded by a full work queue.
    pub items_dropped: u64,
    /// Node restarts.
    pub restarts: u32,
    /// Stream attempts, the first included.
    pub attempts: u32,
    /// Replay buffer fill level at the end of the run.
    pub buffer: Option<BufferOccupancy>,
    /// Wall time of the run.
    pub duration_ms: u64,
}

impl ExecutionSummary {
    /// Returns the summary as an event payload.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Item counters shared by concurrently processed items.
#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    pub(crate) processed: AtomicU64,
    pub(crate) replayed: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) dropped: AtomicU64,
}

impl RunCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshots the item counters; run-level fields start at zero.
    pub(crate) fn summary(&self, node_id: &str, strategy: &str, status: NodeRunStatus) -> ExecutionSummary {
        ExecutionSummary {
            node_id: node_id.to_string(),
            status,
            strategy: strategy.to_string(),
            items_processed: self.processed.load(Ordering::Relaxed),
            items_replayed: self.replayed.load(Ordering::Relaxed),
            item_retries: self.retries.load(Ordering::Relaxed),
            items_skipped: self.skipped.load(Ordering::Relaxed),
            items_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            items_dropped: self.dropped.load(Ordering::Relaxed),
            restarts: 0,
            attempts: 0,
            buffer: None,
            duration_ms: 0,
        }
    }
}

pub(crate) fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Outputs and summary of a node run.
#[derive(Debug, Clone)]
pub struct NodeRunResult<O> {
    /// Outputs of the final attempt, in emission order.
    pub outputs: Vec<O>,
    /// Run counters.
    pub summary: ExecutionSummary,
}

impl<O> NodeRunResult<O> {
    /// Returns the final status.
    #[must_use]
    pub fn status(&self) -> NodeRunStatus {
        self.summary.status
    }

    /// Returns true if every input was consumed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.summary.status == NodeRunStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_snapshot() {
        let counters = RunCounters::default();
        RunCounters::incr(&counters.processed);
        RunCounters::incr(&counters.processed);
        RunCounters::incr(&counters.retries);

        let summary = ExecutionSummary {
            restarts: 1,
            attempts: 2,
            duration_ms: elapsed_ms(Duration::from_millis(1500)),
            ..counters.summary("parse", "sequential", NodeRunStatus::Completed)
        };

        assert_eq!(summary.items_processed, 2);
        assert_eq!(summary.item_retries, 1);
        assert_eq!(summary.duration_ms, 1500);

        let json = summary.to_json();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["restarts"], 1);
    }
}
