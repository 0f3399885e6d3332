//! Destinations for items that could not be processed.

use crate::context::PipelineContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Receives items after a `DeadLetter` decision.
///
/// A returned error is logged by the caller and the item is treated as skipped.
#[async_trait]
pub trait DeadLetterSink<I>: Send + Sync
where
    I: Send + Sync + 'static,
{
    /// Stores or forwards the failed item.
    async fn handle(
        &self,
        node_id: &str,
        item: &I,
        error: &anyhow::Error,
        ctx: &PipelineContext,
    ) -> anyhow::Result<()>;
}

/// A dead-lettered item with its failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope<I> {
    /// Envelope id.
    pub id: Uuid,
    /// Run that produced the failure.
    pub run_id: Uuid,
    /// Node that failed to process the item.
    pub node_id: String,
    /// The item.
    pub item: I,
    /// Rendered error chain.
    pub error: String,
    /// When the item was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

impl<I> DeadLetterEnvelope<I> {
    /// Creates an envelope for `item`.
    #[must_use]
    pub fn new(node_id: impl Into<String>, item: I, error: &anyhow::Error, ctx: &PipelineContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: ctx.run_id(),
            node_id: node_id.into(),
            item,
            error: format!("{error:#}"),
            failed_at: Utc::now(),
        }
    }
}

/// Logs dead-lettered items and drops them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl<I> DeadLetterSink<I> for LoggingDeadLetterSink
where
    I: Send + Sync + 'static,
{
    async fn handle(
        &self,
        node_id: &str,
        _item: &I,
        error: &anyhow::Error,
        ctx: &PipelineContext,
    ) -> anyhow::Result<()> {
        warn!(
            node_id = %node_id,
            run_id = %ctx.run_id(),
            error = %format!("{error:#}"),
            "Item dead-lettered"
        );
        Ok(())
    }
}

/// Keeps dead-lettered items in memory.
#[derive(Debug)]
pub struct InMemoryDeadLetterSink<I> {
    envelopes: Mutex<Vec<DeadLetterEnvelope<I>>>,
}

impl<I> Default for InMemoryDeadLetterSink<I> {
    fn default() -> Self {
        Self {
            envelopes: Mutex::new(Vec::new()),
        }
    }
}

impl<I: Clone> InMemoryDeadLetterSink<I> {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the stored envelopes.
    #[must_use]
    pub fn envelopes(&self) -> Vec<DeadLetterEnvelope<I>> {
        self.envelopes.lock().clone()
    }

    /// Returns the stored items in arrival order.
    #[must_use]
    pub fn items(&self) -> Vec<I> {
        self.envelopes.lock().iter().map(|e| e.item.clone()).collect()
    }

    /// Returns the number of stored envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.lock().len()
    }

    /// Returns true if nothing was dead-lettered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.lock().is_empty()
    }

    /// Removes and returns every stored envelope.
    pub fn drain(&self) -> Vec<DeadLetterEnvelope<I>> {
        std::mem::take(&mut *self.envelopes.lock())
    }
}

#[async_trait]
impl<I> DeadLetterSink<I> for InMemoryDeadLetterSink<I>
where
    I: Clone + Send + Sync + 'static,
{
    async fn handle(
        &self,
        node_id: &str,
        item: &I,
        error: &anyhow::Error,
        ctx: &PipelineContext,
    ) -> anyhow::Result<()> {
        let envelope = DeadLetterEnvelope::new(node_id, item.clone(), error, ctx);
        self.envelopes.lock().push(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[tokio::test]
    async fn test_in_memory_sink_keeps_envelopes() {
        let sink = InMemoryDeadLetterSink::new();
        let ctx = PipelineContext::new("orders");
        let error = Err::<(), _>(anyhow::anyhow!("timeout"))
            .context("fetch failed")
            .unwrap_err();

        sink.handle("fetch", &"order-7".to_string(), &error, &ctx)
            .await
            .unwrap();

        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].node_id, "fetch");
        assert_eq!(envelopes[0].item, "order-7");
        assert_eq!(envelopes[0].run_id, ctx.run_id());
        assert_eq!(envelopes[0].error, "fetch failed: timeout");

        assert_eq!(sink.drain().len(), 1);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_logging_sink_accepts_any_item() {
        let ctx = PipelineContext::new("orders");
        let result = DeadLetterSink::<u64>::handle(
            &LoggingDeadLetterSink,
            "fetch",
            &7,
            &anyhow::anyhow!("boom"),
            &ctx,
        )
        .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_envelope_serializes() {
        let ctx = PipelineContext::new("orders");
        let envelope = DeadLetterEnvelope::new("fetch", 3u8, &anyhow::anyhow!("bad"), &ctx);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["item"], 3);
        assert_eq!(json["error"], "bad");
    }
}
