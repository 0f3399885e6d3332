//! Unwrapped node execution.

use super::decisions::{FixedPipelineErrorHandler, PipelineErrorDecision, PipelineErrorHandler};
use super::node::Node;
use super::resilient::{cancelled_error, report_failure, AttemptFailure};
use super::strategy::ExecutionStrategy;
use super::summary::{elapsed_ms, ExecutionSummary, NodeRunResult, NodeRunStatus, RunCounters};
use crate::context::PipelineContext;
use crate::errors::{ConfigurationError, ResilienceError, RestartPrerequisite};
use crate::events::event_types;
use crate::observability::node_span;
use futures::stream::{Stream, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};

/// Runs a node once, without item handling, buffering or circuit breaking.
///
/// The first item error fails the stream. The stream handler may still
/// continue without the node or fail the pipeline; `RestartNode` is a
/// configuration error because nothing was materialized.
pub struct DirectExecution<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    node_id: String,
    node: Arc<dyn Node<I, O>>,
    strategy: ExecutionStrategy,
    pipeline_handler: Arc<dyn PipelineErrorHandler>,
}

impl<I, O> DirectExecution<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Runs `node` under the id `node_id`.
    pub fn new(node_id: impl Into<String>, node: impl Node<I, O> + 'static) -> Self {
        Self {
            node_id: node_id.into(),
            node: Arc::new(node),
            strategy: ExecutionStrategy::default(),
            pipeline_handler: Arc::new(FixedPipelineErrorHandler::default()),
        }
    }

    /// Sets the execution strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the stream-level error handler.
    #[must_use]
    pub fn with_pipeline_error_handler(mut self, handler: impl PipelineErrorHandler + 'static) -> Self {
        self.pipeline_handler = Arc::new(handler);
        self
    }

    /// Runs the node over `input`.
    pub async fn run<S>(&self, input: S, ctx: &PipelineContext) -> Result<NodeRunResult<O>, ResilienceError>
    where
        S: Stream<Item = anyhow::Result<I>>,
    {
        let span = node_span(ctx, &self.node_id, self.strategy.name());
        self.run_once(input, ctx).instrument(span).await
    }

    async fn run_once<S>(&self, input: S, ctx: &PipelineContext) -> Result<NodeRunResult<O>, ResilienceError>
    where
        S: Stream<Item = anyhow::Result<I>>,
    {
        let started = Instant::now();
        self.strategy.validate()?;
        let counters = &RunCounters::default();
        let node_id = self.node_id.as_str();

        let source = input.map(|next| {
            if ctx.is_cancelled() {
                return Err(AttemptFailure::Fatal(cancelled_error(ctx)));
            }
            next.map_err(|err| {
                AttemptFailure::Stream(err.context(format!("upstream of node '{node_id}' failed")))
            })
        });
        let run = self
            .strategy
            .run(
                source,
                move |item| async move {
                    match ctx.cancellation().run_until_cancelled(self.node.process(item, ctx)).await {
                        None => Err(AttemptFailure::Fatal(cancelled_error(ctx))),
                        Some(Ok(output)) => {
                            RunCounters::incr(&counters.processed);
                            Ok(Some(output))
                        }
                        Some(Err(err)) => Err(AttemptFailure::Stream(err)),
                    }
                },
                ctx.cancellation(),
            )
            .await;
        counters.dropped.fetch_add(run.dropped as u64, Ordering::Relaxed);

        let summary = |status| ExecutionSummary {
            attempts: 1,
            duration_ms: elapsed_ms(started.elapsed()),
            ..counters.summary(node_id, self.strategy.name(), status)
        };

        let error = match run.failure {
            None if run.cancelled => return Err(report_failure(node_id, ctx, cancelled_error(ctx))),
            None => {
                let summary = summary(NodeRunStatus::Completed);
                debug!(node_id = %node_id, outputs = run.outputs.len(), "Node completed");
                ctx.try_emit_event(event_types::NODE_COMPLETED, summary.to_json());
                return Ok(NodeRunResult {
                    outputs: run.outputs,
                    summary,
                });
            }
            Some(AttemptFailure::Fatal(err)) => return Err(report_failure(node_id, ctx, err)),
            Some(AttemptFailure::Stream(err)) => err,
        };

        match self.pipeline_handler.handle_node_failure(node_id, &error, ctx).await {
            PipelineErrorDecision::RestartNode => {
                let err = ConfigurationError::missing_prerequisite(
                    node_id,
                    RestartPrerequisite::ResilientExecutionStrategy,
                );
                Err(report_failure(node_id, ctx, err.into()))
            }
            PipelineErrorDecision::ContinueWithoutNode => {
                let summary = summary(NodeRunStatus::ContinuedWithoutNode);
                warn!(node_id = %node_id, error = %format!("{error:#}"), "Continuing without node");
                ctx.try_emit_event(event_types::NODE_CONTINUE_WITHOUT, summary.to_json());
                Ok(NodeRunResult {
                    outputs: run.outputs,
                    summary,
                })
            }
            PipelineErrorDecision::FailPipeline => {
                let err = ResilienceError::NodeFailed {
                    node_id: node_id.to_string(),
                    source: error,
                };
                Err(report_failure(node_id, ctx, err))
            }
        }
    }
}

impl<I, O> std::fmt::Debug for DirectExecution<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectExecution")
            .field("node_id", &self.node_id)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
