//! Test doubles for resilient node execution.
//!
//! - [`FlakyNode`] fails on a script
//! - sequence handlers replay queued decisions
//! - [`FailingDeadLetterSink`] exercises the sink-failure path

mod handlers;
mod nodes;

pub use handlers::{FailingDeadLetterSink, SequenceNodeErrorHandler, SequencePipelineErrorHandler};
pub use nodes::FlakyNode;
