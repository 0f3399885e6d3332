//! Per-run execution context shared by every node of a pipeline.

use crate::cancellation::CancellationToken;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::events::{EventSink, NoOpEventSink};
use crate::retry::{NodeRetryOverrides, RetryOptions};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Context of one pipeline run.
///
/// Carries the run identity, the cancellation token, the event sink, the
/// pipeline-level retry options with per-node overrides, and the breaker
/// registry. Nothing here is process-global; two runs with different
/// contexts never share state unless they share the registry explicitly.
#[derive(Clone)]
pub struct PipelineContext {
    run_id: Uuid,
    pipeline_name: String,
    started_at: DateTime<Utc>,
    cancellation: Arc<CancellationToken>,
    event_sink: Arc<dyn EventSink>,
    retry_options: RetryOptions,
    node_overrides: HashMap<String, NodeRetryOverrides>,
    breaker_registry: Arc<CircuitBreakerRegistry>,
}

impl PipelineContext {
    /// Creates a context with a fresh run id and default collaborators.
    #[must_use]
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            started_at: Utc::now(),
            cancellation: Arc::new(CancellationToken::new()),
            event_sink: Arc::new(NoOpEventSink),
            retry_options: RetryOptions::default(),
            node_overrides: HashMap::new(),
            breaker_registry: Arc::new(CircuitBreakerRegistry::default()),
        }
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Shares an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Sets the pipeline-level retry options.
    #[must_use]
    pub fn with_retry_options(mut self, options: RetryOptions) -> Self {
        self.retry_options = options;
        self
    }

    /// Sets retry overrides for one node.
    #[must_use]
    pub fn with_node_overrides(mut self, node_id: impl Into<String>, overrides: NodeRetryOverrides) -> Self {
        self.node_overrides.insert(node_id.into(), overrides);
        self
    }

    /// Shares an existing breaker registry.
    #[must_use]
    pub fn with_breaker_registry(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breaker_registry = registry;
        self
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Returns when the context was created.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancellation
    }

    /// Returns the event sink.
    #[must_use]
    pub fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.event_sink
    }

    /// Returns the breaker registry.
    #[must_use]
    pub fn breaker_registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breaker_registry
    }

    /// Returns the pipeline-level retry options.
    #[must_use]
    pub fn retry_options(&self) -> &RetryOptions {
        &self.retry_options
    }

    /// Resolves the retry options of `node_id`, applying its overrides.
    #[must_use]
    pub fn retry_options_for(&self, node_id: &str) -> RetryOptions {
        match self.node_overrides.get(node_id) {
            Some(overrides) => self.retry_options.with_overrides(overrides),
            None => self.retry_options,
        }
    }

    /// Returns true once the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancels the run.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancellation.cancel(reason);
    }

    /// Emits an event without blocking, tagged with the run identity.
    pub fn try_emit_event(&self, event_type: &str, data: serde_json::Value) {
        self.event_sink.try_emit(event_type, Some(self.tag(data)));
    }

    /// Emits an event, tagged with the run identity.
    pub async fn emit_event(&self, event_type: &str, data: serde_json::Value) {
        self.event_sink.emit(event_type, Some(self.tag(data))).await;
    }

    fn tag(&self, mut data: serde_json::Value) -> serde_json::Value {
        if let serde_json::Value::Object(map) = &mut data {
            map.insert("run_id".to_string(), serde_json::json!(self.run_id.to_string()));
            map.insert("pipeline".to_string(), serde_json::json!(self.pipeline_name));
        }
        data
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("run_id", &self.run_id)
            .field("pipeline_name", &self.pipeline_name)
            .field("started_at", &self.started_at)
            .field("cancelled", &self.is_cancelled())
            .field("retry_options", &self.retry_options)
            .finish_non_exhaustive()
    }
}
