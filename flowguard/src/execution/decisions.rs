//! Error decisions and the handlers that produce them.
//!
//! Handlers carry policy; the execution layer only dispatches on the
//! returned decision.

use crate::context::PipelineContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What to do with an item whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorDecision {
    /// Drop the item and continue.
    Skip,
    /// Process the item again after a backoff delay.
    Retry,
    /// Hand the item to the dead-letter sink and continue.
    DeadLetter,
    /// Escalate to a stream-level failure.
    #[default]
    Fail,
}

impl fmt::Display for NodeErrorDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Skip => "skip",
            Self::Retry => "retry",
            Self::DeadLetter => "dead_letter",
            Self::Fail => "fail",
        })
    }
}

/// What to do with a node whose stream failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineErrorDecision {
    /// Replay the node's input from the start.
    RestartNode,
    /// End the node's output here and let the pipeline go on.
    ContinueWithoutNode,
    /// Fail the pipeline with the node's error.
    #[default]
    FailPipeline,
}

impl fmt::Display for PipelineErrorDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RestartNode => "restart_node",
            Self::ContinueWithoutNode => "continue_without_node",
            Self::FailPipeline => "fail_pipeline",
        })
    }
}

/// Decides the fate of a failed item.
#[async_trait]
pub trait NodeErrorHandler<I>: Send + Sync
where
    I: Send + Sync + 'static,
{
    /// Returns the decision for `item`, which failed with `error`.
    async fn handle(
        &self,
        node_id: &str,
        item: &I,
        error: &anyhow::Error,
        ctx: &PipelineContext,
    ) -> NodeErrorDecision;
}

/// Decides the fate of a failed node stream.
#[async_trait]
pub trait PipelineErrorHandler: Send + Sync {
    /// Returns the decision for `node_id`, whose stream failed with `error`.
    async fn handle_node_failure(
        &self,
        node_id: &str,
        error: &anyhow::Error,
        ctx: &PipelineContext,
    ) -> PipelineErrorDecision;
}

#[async_trait]
impl<I, T> NodeErrorHandler<I> for Arc<T>
where
    I: Send + Sync + 'static,
    T: NodeErrorHandler<I> + ?Sized,
{
    async fn handle(
        &self,
        node_id: &str,
        item: &I,
        error: &anyhow::Error,
        ctx: &PipelineContext,
    ) -> NodeErrorDecision {
        (**self).handle(node_id, item, error, ctx).await
    }
}

#[async_trait]
impl<T> PipelineErrorHandler for Arc<T>
where
    T: PipelineErrorHandler + ?Sized,
{
    async fn handle_node_failure(
        &self,
        node_id: &str,
        error: &anyhow::Error,
        ctx: &PipelineContext,
    ) -> PipelineErrorDecision {
        (**self).handle_node_failure(node_id, error, ctx).await
    }
}

/// Item handler that always returns the same decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedNodeErrorHandler(pub NodeErrorDecision);

#[async_trait]
impl<I> NodeErrorHandler<I> for FixedNodeErrorHandler
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
        self.0
    }
}

/// Stream handler that always returns the same decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedPipelineErrorHandler(pub PipelineErrorDecision);

#[async_trait]
impl PipelineErrorHandler for FixedPipelineErrorHandler {
    async fn handle_node_failure(
        &self,
        _node_id: &str,
        _error: &anyhow::Error,
        _ctx: &PipelineContext,
    ) -> PipelineErrorDecision {
        self.0
    }
}

/// Item handler backed by a closure over the item and error.
pub struct FnNodeErrorHandler<F> {
    func: F,
}

impl<F> FnNodeErrorHandler<F> {
    /// Wraps `func`.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnNodeErrorHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnNodeErrorHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<I, F> NodeErrorHandler<I> for FnNodeErrorHandler<F>
where
    I: Send + Sync + 'static,
    F: Fn(&I, &anyhow::Error) -> NodeErrorDecision + Send + Sync,
{
    async fn handle(
        &self,
        _node_id: &str,
        item: &I,
        error: &anyhow::Error,
        _ctx: &PipelineContext,
    ) -> NodeErrorDecision {
        (self.func)(item, error)
    }
}

/// Stream handler backed by a closure over the node id and error.
pub struct FnPipelineErrorHandler<F> {
    func: F,
}

impl<F> FnPipelineErrorHandler<F> {
    /// Wraps `func`.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnPipelineErrorHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPipelineErrorHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> PipelineErrorHandler for FnPipelineErrorHandler<F>
where
    F: Fn(&str, &anyhow::Error) -> PipelineErrorDecision + Send + Sync,
{
    async fn handle_node_failure(
        &self,
        node_id: &str,
        error: &anyhow::Error,
        _ctx: &PipelineContext,
    ) -> PipelineErrorDecision {
        (self.func)(node_id, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_handlers() {
        let ctx = PipelineContext::new("test");
        let error = anyhow::anyhow!("boom");

        let item_handler = FixedNodeErrorHandler(NodeErrorDecision::Skip);
        let decision = item_handler.handle("parse", &1u32, &error, &ctx).await;
        assert_eq!(decision, NodeErrorDecision::Skip);

        let stream_handler = FixedPipelineErrorHandler::default();
        let decision = stream_handler.handle_node_failure("parse", &error, &ctx).await;
        assert_eq!(decision, PipelineErrorDecision::FailPipeline);
    }

    #[tokio::test]
    async fn test_closure_handlers() {
        let ctx = PipelineContext::new("test");
        let handler = FnNodeErrorHandler::new(|item: &u32, _: &anyhow::Error| {
            if *item % 2 == 0 {
                NodeErrorDecision::Retry
            } else {
                NodeErrorDecision::DeadLetter
            }
        });
        let error = anyhow::anyhow!("boom");

        assert_eq!(handler.handle("n", &2, &error, &ctx).await, NodeErrorDecision::Retry);
        assert_eq!(handler.handle("n", &3, &error, &ctx).await, NodeErrorDecision::DeadLetter);

        let handler = FnPipelineErrorHandler::new(|node_id: &str, _: &anyhow::Error| {
            if node_id == "optional" {
                PipelineErrorDecision::ContinueWithoutNode
            } else {
                PipelineErrorDecision::RestartNode
            }
        });
        assert_eq!(
            handler.handle_node_failure("optional", &error, &ctx).await,
            PipelineErrorDecision::ContinueWithoutNode
        );
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_string(&PipelineErrorDecision::ContinueWithoutNode).unwrap();
        assert_eq!(json, "\"continue_without_node\"");
        assert_eq!(NodeErrorDecision::DeadLetter.to_string(), "dead_letter");
    }
}
