//! Handlers and sinks that replay a scripted sequence of outcomes.

use crate::context::PipelineContext;
use crate::execution::{
    DeadLetterSink, NodeErrorDecision, NodeErrorHandler, PipelineErrorDecision, PipelineErrorHandler,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Item handler returning queued decisions, then a fallback.
#[derive(Debug)]
pub struct SequenceNodeErrorHandler {
    decisions: Mutex<VecDeque<NodeErrorDecision>>,
    fallback: NodeErrorDecision,
    calls: AtomicUsize,
}

impl SequenceNodeErrorHandler {
    /// Returns `decisions` in order, then `fallback` forever.
    #[must_use]
    pub fn new(decisions: impl IntoIterator<Item = NodeErrorDecision>, fallback: NodeErrorDecision) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of decisions handed out.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<I> NodeErrorHandler<I> for SequenceNodeErrorHandler
where
    I: Send + Sync + 'static,
{
    async fn handle(
        &self,
        _node_id: &str,
        _item: &I,
        _error: &anyhow::Error,
        _ctx: &PipelineContext,
    ) -> NodeErrorDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decisions.lock().pop_front().unwrap_or(self.fallback)
    }
}

/// Stream handler returning queued decisions, then a fallback.
#[derive(Debug)]
pub struct SequencePipelineErrorHandler {
    decisions: Mutex<VecDeque<PipelineErrorDecision>>,
    fallback: PipelineErrorDecision,
    errors: Mutex<Vec<String>>,
}

impl SequencePipelineErrorHandler {
    /// Returns `decisions` in order, then `fallback` forever.
    #[must_use]
    pub fn new(
        decisions: impl IntoIterator<Item = PipelineErrorDecision>,
        fallback: PipelineErrorDecision,
    ) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            fallback,
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of stream failures handled.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.errors.lock().len()
    }

    /// Returns the rendered errors passed in, in order.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

#[async_trait]
impl PipelineErrorHandler for SequencePipelineErrorHandler {
    async fn handle_node_failure(
        &self,
        _node_id: &str,
        error: &anyhow::Error,
        _ctx: &PipelineContext,
    ) -> PipelineErrorDecision {
        self.errors.lock().push(format!("{error:#}"));
        self.decisions.lock().pop_front().unwrap_or(self.fallback)
    }
}

/// Dead-letter sink that always fails.
#[derive(Debug, Default)]
pub struct FailingDeadLetterSink {
    calls: AtomicUsize,
}

impl FailingDeadLetterSink {
    /// Creates the sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of items offered.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<I> DeadLetterSink<I> for FailingDeadLetterSink
where
    I: Send + Sync + 'static,
{
    async fn handle(
        &self,
        _node_id: &str,
        _item: &I,
        _error: &anyhow::Error,
        _ctx: &PipelineContext,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("dead-letter store unavailable")
    }
}
