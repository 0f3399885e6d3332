//! Scripted nodes for exercising failure paths.

use crate::context::PipelineContext;
use crate::execution::Node;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A node that applies a transform, failing on demand.
///
/// Failures can be scripted per item (fail the next `n` calls for that
/// item, or always) or globally (fail the first `n` calls overall).
pub struct FlakyNode<I, O> {
    transform: Box<dyn Fn(&I) -> O + Send + Sync>,
    per_item: Mutex<HashMap<I, usize>>,
    always: HashSet<I>,
    fail_first_calls: usize,
    latency: Option<Duration>,
    calls: AtomicUsize,
    seen: Mutex<Vec<I>>,
}

impl<I, O> FlakyNode<I, O>
where
    I: Clone + Eq + Hash,
{
    /// Creates a node that maps items with `transform`.
    pub fn new(transform: impl Fn(&I) -> O + Send + Sync + 'static) -> Self {
        Self {
            transform: Box::new(transform),
            per_item: Mutex::new(HashMap::new()),
            always: HashSet::new(),
            fail_first_calls: 0,
            latency: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Fails the next `times` calls for `item`.
    #[must_use]
    pub fn fail_times(self, item: I, times: usize) -> Self {
        self.per_item.lock().insert(item, times);
        self
    }

    /// Fails every call for `item`.
    #[must_use]
    pub fn always_fail(mut self, item: I) -> Self {
        self.always.insert(item);
        self
    }

    /// Fails the first `calls` calls regardless of the item.
    #[must_use]
    pub fn fail_first_calls(mut self, calls: usize) -> Self {
        self.fail_first_calls = calls;
        self
    }

    /// Sleeps before every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns the number of calls made.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns every item received, in call order.
    #[must_use]
    pub fn seen(&self) -> Vec<I> {
        self.seen.lock().clone()
    }

    fn should_fail(&self, item: &I, call: usize) -> bool {
        if call < self.fail_first_calls || self.always.contains(item) {
            return true;
        }
        let mut per_item = self.per_item.lock();
        match per_item.get_mut(item) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl<I, O> Node<I, O> for FlakyNode<I, O>
where
    I: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
    O: Send + 'static,
{
    async fn process(&self, item: I, _ctx: &PipelineContext) -> anyhow::Result<O> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(item.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.should_fail(&item, call) {
            anyhow::bail!("scripted failure for {item:?} on call {call}");
        }
        Ok((self.transform)(&item))
    }
}

impl<I, O> std::fmt::Debug for FlakyNode<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyNode")
            .field("fail_first_calls", &self.fail_first_calls)
            .field("calls", &self.calls.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures() {
        let ctx = PipelineContext::new("test");
        let node = FlakyNode::new(|n: &u32| n * 2)
            .fail_times(1, 2)
            .always_fail(3)
            .fail_first_calls(1);

        assert!(node.process(0, &ctx).await.is_err());
        assert_eq!(node.process(0, &ctx).await.unwrap(), 0);
        assert!(node.process(1, &ctx).await.is_err());
        assert!(node.process(1, &ctx).await.is_err());
        assert_eq!(node.process(1, &ctx).await.unwrap(), 2);
        assert!(node.process(3, &ctx).await.is_err());
        assert!(node.process(3, &ctx).await.is_err());

        assert_eq!(node.calls(), 7);
        assert_eq!(node.seen(), vec![0, 0, 1, 1, 1, 3, 3]);
    }
}
