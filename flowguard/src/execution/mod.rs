//! Node execution with item- and stream-level failure handling.
//!
//! [`ResilientExecutionWrapper`] is the full layer: per-item retries with
//! backoff, dead-lettering, stream restarts replayed from a bounded buffer,
//! and circuit breaking. [`DirectExecution`] runs a node without any of it.
//! Both delegate item scheduling to an [`ExecutionStrategy`].

mod dead_letter;
mod decisions;
mod direct;
mod node;
mod resilient;
mod strategy;
mod summary;


pub use dead_letter::{DeadLetterEnvelope, DeadLetterSink, InMemoryDeadLetterSink, LoggingDeadLetterSink};
pub use decisions::{
    FixedNodeErrorHandler, FixedPipelineErrorHandler, FnNodeErrorHandler, FnPipelineErrorHandler,
    NodeErrorDecision, NodeErrorHandler, PipelineErrorDecision, PipelineErrorHandler,
};
pub use direct::DirectExecution;
pub use node::{node_fn, FnNode, Node};
pub use resilient::ResilientExecutionWrapper;
pub use strategy::{ExecutionStrategy, ParallelOptions, QueuePolicy, StrategyRun};
pub use summary::{ExecutionSummary, NodeRunResult, NodeRunStatus};
