//! The unit of work wrapped by the execution layer.

use crate::context::PipelineContext;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;

/// Processes one input item into one output item.
///
/// Errors are opaque to the execution layer; the item- and stream-level
/// handlers decide what happens next.
#[async_trait]
pub trait Node<I, O>: Send + Sync
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Processes a single item.
    async fn process(&self, item: I, ctx: &PipelineContext) -> anyhow::Result<O>;
}

/// A node backed by an async closure.
pub struct FnNode<F> {
    func: F,
}

/// Creates a node from an async closure.
///
/// ```rust,ignore
/// let double = node_fn(|n: u32| async move { Ok(n * 2) });
/// ```
pub fn node_fn<F>(func: F) -> FnNode<F> {
    FnNode { func }
}

impl<F> fmt::Debug for FnNode<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnNode").finish_non_exhaustive()
    }
}

#[async_trait]
impl<I, O, F, Fut> Node<I, O> for FnNode<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
{
    async fn process(&self, item: I, _ctx: &PipelineContext) -> anyhow::Result<O> {
        (self.func)(item).await
    }
}
