//! Resilient execution of one node.
//!
//! Every attempt, the first run and each restart, must be admitted by the
//! node's circuit breaker. Item failures go through the item handler (retry,
//! skip, dead-letter or fail). Whatever stays unresolved becomes a stream
//! failure, which fails fast while the circuit is open and is otherwise
//! resolved by the stream handler (restart from the replay buffer, continue
//! without the node, or fail).

use super::dead_letter::{DeadLetterSink, LoggingDeadLetterSink};
use super::decisions::{
    FixedNodeErrorHandler, FixedPipelineErrorHandler, NodeErrorDecision, NodeErrorHandler,
    PipelineErrorDecision, PipelineErrorHandler,
};
use super::node::Node;
use super::strategy::ExecutionStrategy;
use super::summary::{elapsed_ms, ExecutionSummary, NodeRunResult, NodeRunStatus, RunCounters};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::context::PipelineContext;
use crate::errors::{ConfigurationError, ResilienceError};
use crate::events::event_types;
use crate::observability::node_span;
use crate::replay::ReplayBuffer;
use crate::retry::{RetryDelayStrategy, RetryOptions};
use futures::stream::{self, Stream, StreamExt};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Why an attempt stopped.
pub(crate) enum AttemptFailure {
    /// Resolved by the stream-level decision.
    Stream(anyhow::Error),
    /// Ends the run without consulting any handler.
    Fatal(ResilienceError),
}

pub(crate) fn cancelled_error(ctx: &PipelineContext) -> ResilienceError {
    ResilienceError::Cancelled(
        ctx.cancellation()
            .reason()
            .unwrap_or_else(|| "cancelled".to_string()),
    )
}

/// Logs and reports a terminal node error, then hands it back.
pub(crate) fn report_failure(node_id: &str, ctx: &PipelineContext, err: ResilienceError) -> ResilienceError {
    warn!(node_id = %node_id, error = %err, "Node failed");
    let mut data: serde_json::Map<String, serde_json::Value> = err.to_dict().into_iter().collect();
    data.insert("node_id".to_string(), serde_json::json!(node_id));
    ctx.try_emit_event(event_types::NODE_FAILED, serde_json::Value::Object(data));
    err
}

/// Runs a node with item retries, stream restarts and circuit breaking.
///
/// Retry options come from the pipeline context (with the node's overrides)
/// unless set explicitly. Without a circuit breaker configuration the node
/// is never gated. Restarts replay every item the node consumed so far,
/// then continue with the rest of the upstream; outputs of the failed
/// attempt are discarded.
pub struct ResilientExecutionWrapper<I, O>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    node_id: String,
    node: Arc<dyn Node<I, O>>,
    strategy: ExecutionStrategy,
    retry_options: Option<RetryOptions>,
    breaker_config: Option<CircuitBreakerConfig>,
    item_handler: Arc<dyn NodeErrorHandler<I>>,
    pipeline_handler: Arc<dyn PipelineErrorHandler>,
    dead_letter_sink: Arc<dyn DeadLetterSink<I>>,
    delays: RetryDelayStrategy,
}

impl<I, O> ResilientExecutionWrapper<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    /// Wraps `node` under the id `node_id`.
    ///
    /// Defaults: sequential strategy, items fail, streams fail the
    /// pipeline, dead letters are logged, no circuit breaker.
    pub fn new(node_id: impl Into<String>, node: impl Node<I, O> + 'static) -> Self {
        Self::from_arc(node_id, Arc::new(node))
    }

    /// Wraps a shared node.
    pub fn from_arc(node_id: impl Into<String>, node: Arc<dyn Node<I, O>>) -> Self {
        Self {
            node_id: node_id.into(),
            node,
            strategy: ExecutionStrategy::default(),
            retry_options: None,
            breaker_config: None,
            item_handler: Arc::new(FixedNodeErrorHandler::default()),
            pipeline_handler: Arc::new(FixedPipelineErrorHandler::default()),
            dead_letter_sink: Arc::new(LoggingDeadLetterSink),
            delays: RetryDelayStrategy::default(),
        }
    }

    /// Sets the inner execution strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Uses `options` instead of the context's options for this node.
    #[must_use]
    pub fn with_retry_options(mut self, options: RetryOptions) -> Self {
        self.retry_options = Some(options);
        self
    }

    /// Guards the node with a circuit breaker from the context's registry.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = Some(config);
        self
    }

    /// Sets the item-level error handler.
    #[must_use]
    pub fn with_item_error_handler(mut self, handler: impl NodeErrorHandler<I> + 'static) -> Self {
        self.item_handler = Arc::new(handler);
        self
    }

    /// Sets the stream-level error handler.
    #[must_use]
    pub fn with_pipeline_error_handler(mut self, handler: impl PipelineErrorHandler + 'static) -> Self {
        self.pipeline_handler = Arc::new(handler);
        self
    }

    /// Sets the dead-letter sink.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink<I>>) -> Self {
        self.dead_letter_sink = sink;
        self
    }

    /// Sets the delay strategy for item retries.
    #[must_use]
    pub fn with_delay_strategy(mut self, delays: RetryDelayStrategy) -> Self {
        self.delays = delays;
        self
    }

    /// Returns the node id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Returns the retry options a run under `ctx` would use.
    #[must_use]
    pub fn resolve_options(&self, ctx: &PipelineContext) -> RetryOptions {
        self.retry_options
            .unwrap_or_else(|| ctx.retry_options_for(&self.node_id))
    }

    /// Runs the node over `input` until it completes or fails terminally.
    ///
    /// Upstream errors are stream failures of this node. Configuration,
    /// capacity and cancellation errors end the run without consulting the
    /// handlers.
    pub async fn run<S>(&self, input: S, ctx: &PipelineContext) -> Result<NodeRunResult<O>, ResilienceError>
    where
        S: Stream<Item = anyhow::Result<I>>,
    {
        let span = node_span(ctx, &self.node_id, self.strategy.name());
        self.run_attempts(input, ctx).instrument(span).await
    }

    async fn run_attempts<S>(&self, input: S, ctx: &PipelineContext) -> Result<NodeRunResult<O>, ResilienceError>
    where
        S: Stream<Item = anyhow::Result<I>>,
    {
        let started = Instant::now();
        let options = self.resolve_options(ctx);
        options.validate()?;
        self.strategy.validate()?;
        let breaker = match self.breaker_config {
            Some(config) => {
                config.validate()?;
                Some(ctx.breaker_registry().get_or_create(&self.node_id, config))
            }
            None => None,
        };

        // Unbounded materialization rules out restarts, so nothing is retained.
        let mut buffer = options
            .max_materialized_items
            .map(|capacity| ReplayBuffer::bounded(capacity).for_node(self.node_id.clone()));
        let counters = &RunCounters::default();
        // Fused: restarts may poll the upstream again after it ended.
        let mut upstream = std::pin::pin!(input.fuse());
        let mut attempts = 0u32;
        let mut restarts = 0u32;

        debug!(
            node_id = %self.node_id,
            strategy = self.strategy.name(),
            max_item_retries = options.max_item_retries,
            max_node_restart_attempts = options.max_node_restart_attempts,
            "Starting resilient node run"
        );

        loop {
            if let Some(breaker) = &breaker {
                if !breaker.allow() {
                    let error = anyhow::anyhow!("execution refused before attempt {}", attempts + 1);
                    return Err(self.reject(ctx, breaker, error));
                }
            }
            attempts += 1;
            if let Some(buffer) = buffer.as_mut() {
                buffer.rewind();
            }

            let run = {
                let source = self.attempt_source(&mut buffer, &mut upstream, ctx, counters);
                self.strategy
                    .run(
                        source,
                        move |item| self.process_item(item, ctx, options, counters),
                        ctx.cancellation(),
                    )
                    .await
            };

            if run.dropped > 0 {
                counters.dropped.fetch_add(run.dropped as u64, Ordering::Relaxed);
                ctx.try_emit_event(
                    event_types::ITEM_DROPPED,
                    serde_json::json!({ "node_id": self.node_id, "dropped": run.dropped }),
                );
            }

            let error = match run.failure {
                None if run.cancelled => {
                    return Err(report_failure(&self.node_id, ctx, cancelled_error(ctx)));
                }
                None => {
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    let summary =
                        self.summary(NodeRunStatus::Completed, counters, restarts, attempts, &buffer, started);
                    info!(
                        node_id = %self.node_id,
                        outputs = run.outputs.len(),
                        attempts,
                        restarts,
                        "Node completed"
                    );
                    ctx.try_emit_event(event_types::NODE_COMPLETED, summary.to_json());
                    return Ok(NodeRunResult {
                        outputs: run.outputs,
                        summary,
                    });
                }
                Some(AttemptFailure::Fatal(err)) => {
                    return Err(report_failure(&self.node_id, ctx, err));
                }
                Some(AttemptFailure::Stream(err)) => err,
            };

            if let Some(breaker) = breaker.as_ref().filter(|b| b.is_rejecting()) {
                return Err(self.reject(ctx, breaker, error));
            }

            let decision = self
                .pipeline_handler
                .handle_node_failure(&self.node_id, &error, ctx)
                .await;
            if let Some(breaker) = &breaker {
                breaker.record_failure();
            }
            debug!(node_id = %self.node_id, decision = %decision, attempts, "Stream failure resolved");

            match decision {
                PipelineErrorDecision::RestartNode => {
                    if let Some(prerequisite) = options.missing_restart_prerequisite() {
                        let err = ConfigurationError::missing_prerequisite(&self.node_id, prerequisite);
                        return Err(report_failure(&self.node_id, ctx, err.into()));
                    }
                    if ctx.is_cancelled() {
                        return Err(report_failure(&self.node_id, ctx, cancelled_error(ctx)));
                    }
                    if let Some(breaker) = breaker.as_ref().filter(|b| b.is_rejecting()) {
                        return Err(self.reject(ctx, breaker, error));
                    }
                    if restarts >= options.max_node_restart_attempts
                        || attempts >= options.max_sequential_attempts
                    {
                        let err = ResilienceError::RestartsExhausted {
                            node_id: self.node_id.clone(),
                            attempts,
                            source: error,
                        };
                        return Err(report_failure(&self.node_id, ctx, err));
                    }

                    restarts += 1;
                    let replay_items = buffer.as_ref().map_or(0, ReplayBuffer::len);
                    info!(
                        node_id = %self.node_id,
                        restart = restarts,
                        replay_items,
                        error = %format!("{error:#}"),
                        "Restarting node from replay buffer"
                    );
                    ctx.emit_event(
                        event_types::NODE_RESTART,
                        serde_json::json!({
                            "node_id": self.node_id,
                            "restart": restarts,
                            "replay_items": replay_items,
                            "error": format!("{error:#}"),
                        }),
                    )
                    .await;
                }
                PipelineErrorDecision::ContinueWithoutNode => {
                    let summary = self.summary(
                        NodeRunStatus::ContinuedWithoutNode,
                        counters,
                        restarts,
                        attempts,
                        &buffer,
                        started,
                    );
                    warn!(
                        node_id = %self.node_id,
                        outputs = run.outputs.len(),
                        error = %format!("{error:#}"),
                        "Continuing without node"
                    );
                    let mut data = summary.to_json();
                    if let Some(map) = data.as_object_mut() {
                        map.insert("error".to_string(), serde_json::json!(format!("{error:#}")));
                    }
                    ctx.try_emit_event(event_types::NODE_CONTINUE_WITHOUT, data);
                    return Ok(NodeRunResult {
                        outputs: run.outputs,
                        summary,
                    });
                }
                PipelineErrorDecision::FailPipeline => {
                    let err = ResilienceError::NodeFailed {
                        node_id: self.node_id.clone(),
                        source: error,
                    };
                    return Err(report_failure(&self.node_id, ctx, err));
                }
            }
        }
    }

    /// Items of one attempt: the replay pass first, then new upstream items,
    /// each appended to the buffer as it is consumed.
    fn attempt_source<'a, U>(
        &'a self,
        buffer: &'a mut Option<ReplayBuffer<I>>,
        upstream: &'a mut U,
        ctx: &'a PipelineContext,
        counters: &'a RunCounters,
    ) -> impl Stream<Item = Result<I, AttemptFailure>> + 'a
    where
        U: Stream<Item = anyhow::Result<I>> + Unpin + 'a,
    {
        let node_id = self.node_id.as_str();
        stream::unfold((buffer, upstream, false), move |(buffer, upstream, done)| async move {
            if done {
                return None;
            }
            if ctx.is_cancelled() {
                let failure = AttemptFailure::Fatal(cancelled_error(ctx));
                return Some((Err(failure), (buffer, upstream, true)));
            }
            if let Some(item) = buffer.as_mut().and_then(ReplayBuffer::next_replayed) {
                RunCounters::incr(&counters.replayed);
                return Some((Ok(item), (buffer, upstream, false)));
            }

            let polled = ctx.cancellation().run_until_cancelled(upstream.next()).await;
            let next = match polled {
                None => {
                    let failure = AttemptFailure::Fatal(cancelled_error(ctx));
                    return Some((Err(failure), (buffer, upstream, true)));
                }
                Some(None) => return None,
                Some(Some(next)) => next,
            };
            let result = match next {
                Ok(item) => match buffer.as_mut() {
                    Some(retained) => retained
                        .append(item.clone())
                        .map(|()| item)
                        .map_err(|err| AttemptFailure::Fatal(err.into())),
                    None => Ok(item),
                },
                Err(err) => Err(AttemptFailure::Stream(
                    err.context(format!("upstream of node '{node_id}' failed")),
                )),
            };
            let done = result.is_err();
            Some((result, (buffer, upstream, done)))
        })
    }

    async fn process_item(
        &self,
        item: I,
        ctx: &PipelineContext,
        options: RetryOptions,
        counters: &RunCounters,
    ) -> Result<Option<O>, AttemptFailure> {
        // Each item walks its own delay sequence.
        let delays = self.delays.fork();
        let mut retries = 0u32;

        loop {
            let outcome = ctx
                .cancellation()
                .run_until_cancelled(self.node.process(item.clone(), ctx))
                .await;
            let error = match outcome {
                None => return Err(AttemptFailure::Fatal(cancelled_error(ctx))),
                Some(Ok(output)) => {
                    RunCounters::incr(&counters.processed);
                    return Ok(Some(output));
                }
                Some(Err(error)) => error,
            };

            match self.item_handler.handle(&self.node_id, &item, &error, ctx).await {
                NodeErrorDecision::Retry => {
                    if retries >= options.max_item_retries {
                        warn!(
                            node_id = %self.node_id,
                            retries,
                            error = %format!("{error:#}"),
                            "Item retries exhausted"
                        );
                        return Err(AttemptFailure::Stream(
                            error.context(format!("item retries exhausted after {retries} retries")),
                        ));
                    }
                    let delay = delays.delay(retries);
                    retries += 1;
                    RunCounters::incr(&counters.retries);
                    let delay_ms = elapsed_ms(delay);
                    debug!(
                        node_id = %self.node_id,
                        attempt = retries,
                        delay_ms,
                        error = %format!("{error:#}"),
                        "Retrying item"
                    );
                    ctx.try_emit_event(
                        event_types::ITEM_RETRY,
                        serde_json::json!({
                            "node_id": self.node_id,
                            "attempt": retries,
                            "delay_ms": delay_ms,
                            "error": format!("{error:#}"),
                        }),
                    );
                    if !ctx.cancellation().sleep(delay).await {
                        return Err(AttemptFailure::Fatal(cancelled_error(ctx)));
                    }
                }
                NodeErrorDecision::Skip => {
                    RunCounters::incr(&counters.skipped);
                    debug!(node_id = %self.node_id, error = %format!("{error:#}"), "Skipping item");
                    ctx.try_emit_event(
                        event_types::ITEM_SKIPPED,
                        serde_json::json!({ "node_id": self.node_id, "error": format!("{error:#}") }),
                    );
                    return Ok(None);
                }
                NodeErrorDecision::DeadLetter => {
                    self.dead_letter(&item, &error, ctx, counters).await;
                    return Ok(None);
                }
                NodeErrorDecision::Fail => return Err(AttemptFailure::Stream(error)),
            }
        }
    }

    async fn dead_letter(&self, item: &I, error: &anyhow::Error, ctx: &PipelineContext, counters: &RunCounters) {
        match self.dead_letter_sink.handle(&self.node_id, item, error, ctx).await {
            Ok(()) => {
                RunCounters::incr(&counters.dead_lettered);
                ctx.try_emit_event(
                    event_types::ITEM_DEAD_LETTERED,
                    serde_json::json!({ "node_id": self.node_id, "error": format!("{error:#}") }),
                );
            }
            Err(sink_error) => {
                RunCounters::incr(&counters.skipped);
                warn!(
                    node_id = %self.node_id,
                    error = %format!("{error:#}"),
                    sink_error = %format!("{sink_error:#}"),
                    "Dead-letter sink failed, skipping item"
                );
                ctx.try_emit_event(
                    event_types::ITEM_SKIPPED,
                    serde_json::json!({
                        "node_id": self.node_id,
                        "error": format!("{error:#}"),
                        "reason": "dead_letter_failed",
                    }),
                );
            }
        }
    }

    fn reject(&self, ctx: &PipelineContext, breaker: &CircuitBreaker, error: anyhow::Error) -> ResilienceError {
        let stats = breaker.statistics();
        warn!(
            node_id = %self.node_id,
            state = %stats.state,
            failure_rate = stats.failure_rate,
            "Circuit breaker rejected node execution"
        );
        ctx.try_emit_event(
            event_types::CIRCUIT_REJECTED,
            serde_json::json!({ "node_id": self.node_id, "statistics": stats }),
        );
        ResilienceError::CircuitOpen {
            node_id: self.node_id.clone(),
            source: error,
        }
    }

    fn summary(
        &self,
        status: NodeRunStatus,
        counters: &RunCounters,
        restarts: u32,
        attempts: u32,
        buffer: &Option<ReplayBuffer<I>>,
        started: Instant,
    ) -> ExecutionSummary {
        ExecutionSummary {
            restarts,
            attempts,
            buffer: buffer.as_ref().map(ReplayBuffer::occupancy),
            duration_ms: elapsed_ms(started.elapsed()),
            ..counters.summary(&self.node_id, self.strategy.name(), status)
        }
    }
}

impl<I, O> fmt::Debug for ResilientExecutionWrapper<I, O>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientExecutionWrapper")
            .field("node_id", &self.node_id)
            .field("strategy", &self.strategy)
            .field("retry_options", &self.retry_options)
            .field("breaker_config", &self.breaker_config)
            .finish_non_exhaustive()
    }
}
