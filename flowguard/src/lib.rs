//! # Flowguard
//!
//! Resilience for node-based stream pipelines.
//!
//! Flowguard wraps a processing node so that failures are resolved by
//! explicit decisions instead of tearing the pipeline down:
//!
//! - **Item-level handling**: retry with backoff and jitter, skip, or dead-letter
//! - **Stream-level handling**: restart the node from a bounded replay buffer,
//!   continue without it, or fail the pipeline
//! - **Circuit breaking**: per-node breakers with consecutive, rolling-count,
//!   rolling-rate and hybrid thresholds, tracked by a bounded registry
//! - **Cancellation**: every wait observes the run's cancellation token
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowguard::prelude::*;
//!
//! let ctx = PipelineContext::new("ingest")
//!     .with_retry_options(
//!         RetryOptions::new()
//!             .with_max_item_retries(3)
//!             .with_max_materialized_items(10_000),
//!     );
//!
//! let wrapper = ResilientExecutionWrapper::new("enrich", node_fn(|n: u32| async move { Ok(n * 2) }))
//!     .with_item_error_handler(FixedNodeErrorHandler(NodeErrorDecision::Retry))
//!     .with_pipeline_error_handler(FixedPipelineErrorHandler(PipelineErrorDecision::RestartNode))
//!     .with_circuit_breaker(CircuitBreakerConfig::consecutive(5, Duration::from_secs(30)));
//!
//! let result = wrapper.run(input, &ctx).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod circuit_breaker;
pub mod context;
pub mod errors;
pub mod events;
pub mod execution;
pub mod observability;
pub mod replay;
pub mod retry;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
        CircuitBreakerRegistryOptions, CircuitBreakerStatistics, CircuitState, ThresholdType,
    };
    pub use crate::context::PipelineContext;
    pub use crate::errors::{
        BufferCapacityError, ConfigurationError, ResilienceError, RestartPrerequisite,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::execution::{
        node_fn, DeadLetterSink, DirectExecution, ExecutionStrategy, ExecutionSummary,
        FixedNodeErrorHandler, FixedPipelineErrorHandler, FnNodeErrorHandler,
        FnPipelineErrorHandler, Node, NodeErrorDecision, NodeErrorHandler, NodeRunResult,
        NodeRunStatus, ParallelOptions, PipelineErrorDecision, PipelineErrorHandler,
        QueuePolicy, ResilientExecutionWrapper,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::replay::{BufferOccupancy, ReplayBuffer};
    pub use crate::retry::{
        BackoffStrategy, JitterStrategy, NodeRetryOverrides, RetryDelayStrategy, RetryOptions,
    };
    pub use std::time::Duration;
}
