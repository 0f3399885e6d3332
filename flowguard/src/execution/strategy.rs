//! Inner execution strategies: how the items of one node run.

use crate::cancellation::CancellationToken;
use crate::errors::ConfigurationError;
use crate::utils::ensure_positive;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// What the producer does when the parallel work queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Wait for room, observing cancellation.
    #[default]
    Block,
    /// Discard the incoming item.
    DropNewest,
}

/// Settings of the bounded worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelOptions {
    /// Items processed concurrently.
    pub max_parallelism: usize,
    /// Items waiting between the source and the workers.
    pub queue_capacity: usize,
    /// Behavior on a full queue.
    pub queue_policy: QueuePolicy,
    /// Emit outputs in input order.
    pub preserve_ordering: bool,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            queue_capacity: 64,
            queue_policy: QueuePolicy::Block,
            preserve_ordering: true,
        }
    }
}

impl ParallelOptions {
    /// Creates options with `max_parallelism` workers.
    #[must_use]
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            max_parallelism,
            ..Self::default()
        }
    }

    /// Sets the queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the full-queue policy.
    #[must_use]
    pub fn with_queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    /// Sets whether outputs keep input order.
    #[must_use]
    pub fn with_preserve_ordering(mut self, preserve: bool) -> Self {
        self.preserve_ordering = preserve;
        self
    }
}

/// How a node's items are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One item at a time, in input order.
    #[default]
    Sequential,
    /// A bounded pool fed through a bounded queue.
    Parallel(ParallelOptions),
}

/// Outcome of running one pass of a node's items.
#[derive(Debug)]
pub struct StrategyRun<O, E> {
    /// Outputs produced before the pass ended.
    pub outputs: Vec<O>,
    /// Items discarded by a `DropNewest` queue.
    pub dropped: usize,
    /// The failure that ended the pass, if any.
    pub failure: Option<E>,
    /// True when the pass stopped on cancellation.
    pub cancelled: bool,
}

impl<O, E> StrategyRun<O, E> {
    fn new() -> Self {
        Self {
            outputs: Vec::new(),
            dropped: 0,
            failure: None,
            cancelled: false,
        }
    }
}

impl ExecutionStrategy {
    /// Creates a parallel strategy with default queue settings.
    #[must_use]
    pub fn parallel(max_parallelism: usize) -> Self {
        Self::Parallel(ParallelOptions::new(max_parallelism))
    }

    /// Validates the strategy settings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::Sequential => Ok(()),
            Self::Parallel(options) => {
                ensure_positive("max_parallelism", options.max_parallelism)?;
                ensure_positive("queue_capacity", options.queue_capacity)
            }
        }
    }

    /// Returns a short name for logs and summaries.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel(_) => "parallel",
        }
    }

    /// Runs `process` over `items` until the source ends or a failure occurs.
    ///
    /// A source error or a failed item ends the pass. `process` returns
    /// `Ok(None)` for items that produce no output. In-flight items are
    /// dropped when the pass ends early.
    pub async fn run<I, O, E, S, F, Fut>(
        &self,
        items: S,
        process: F,
        cancellation: &CancellationToken,
    ) -> StrategyRun<O, E>
    where
        S: Stream<Item = Result<I, E>>,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<Option<O>, E>>,
    {
        match self {
            Self::Sequential => run_sequential(items, process).await,
            Self::Parallel(options) => run_parallel(options, items, process, cancellation).await,
        }
    }
}

async fn run_sequential<I, O, E, S, F, Fut>(items: S, process: F) -> StrategyRun<O, E>
where
    S: Stream<Item = Result<I, E>>,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<Option<O>, E>>,
{
    let mut run = StrategyRun::new();
    let mut items = std::pin::pin!(items);
    while let Some(next) = items.next().await {
        let result = match next {
            Ok(item) => process(item).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(Some(output)) => run.outputs.push(output),
            Ok(None) => {}
            Err(err) => {
                run.failure = Some(err);
                break;
            }
        }
    }
    run
}

async fn run_parallel<I, O, E, S, F, Fut>(
    options: &ParallelOptions,
    items: S,
    process: F,
    cancellation: &CancellationToken,
) -> StrategyRun<O, E>
where
    S: Stream<Item = Result<I, E>>,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<Option<O>, E>>,
{
    let (tx, rx) = mpsc::channel::<I>(options.queue_capacity);
    let policy = options.queue_policy;
    let dropped = &AtomicUsize::new(0);

    let producer = async move {
        let mut source_failure = None;
        let mut cancelled = false;
        let mut items = std::pin::pin!(items);
        while let Some(next) = items.next().await {
            let item = match next {
                Ok(item) => item,
                Err(err) => {
                    source_failure = Some(err);
                    break;
                }
            };
            match policy {
                QueuePolicy::Block => {
                    let sent = tokio::select! {
                        biased;
                        () = cancellation.cancelled() => {
                            cancelled = true;
                            break;
                        }
                        sent = tx.send(item) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                QueuePolicy::DropNewest => match tx.try_send(item) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(dropped = total, "Work queue full, dropping item");
                    }
                    Err(TrySendError::Closed(_)) => break,
                },
            }
        }
        // Closing the queue lets the workers drain and finish.
        drop(tx);
        (source_failure, cancelled)
    };

    let consumer = async {
        let mut outputs = Vec::new();
        let mut failure = None;
        let queued = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let work = queued.map(&process);
        if options.preserve_ordering {
            let results = std::pin::pin!(work.buffered(options.max_parallelism));
            collect_until_failure(results, &mut outputs, &mut failure).await;
        } else {
            let results = std::pin::pin!(work.buffer_unordered(options.max_parallelism));
            collect_until_failure(results, &mut outputs, &mut failure).await;
        }
        (outputs, failure)
    };

    let mut producer = std::pin::pin!(producer);
    let mut consumer = std::pin::pin!(consumer);
    // A failed item ends the pass even while the source is idle, so the
    // producer is abandoned as soon as the workers stop.
    let ((source_failure, cancelled), (outputs, failure)) = tokio::select! {
        produced = &mut producer => (produced, consumer.await),
        consumed = &mut consumer => ((None, false), consumed),
    };

    let mut run = StrategyRun::new();
    run.outputs = outputs;
    run.dropped = dropped.load(Ordering::Relaxed);
    run.failure = failure.or(source_failure);
    run.cancelled = cancelled;
    run
}

async fn collect_until_failure<O, E, S>(
    mut results: S,
    outputs: &mut Vec<O>,
    failure: &mut Option<E>,
) where
    S: Stream<Item = Result<Option<O>, E>> + Unpin,
{
    while let Some(result) = results.next().await {
        match result {
            Ok(Some(output)) => outputs.push(output),
            Ok(None) => {}
            Err(err) => {
                *failure = Some(err);
                return;
            }
        }
    }
}
