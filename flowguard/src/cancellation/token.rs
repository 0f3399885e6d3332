//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn Fn() + Send + Sync>;

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent - only the first cancellation reason is kept.
/// Waiters parked in [`CancellationToken::cancelled`] wake up immediately.
#[derive(Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: RwLock<Vec<CancelCallback>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    ///
    /// Callbacks are invoked immediately. Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        // Held across the flag flip so observers never see a cancelled token without a reason.
        let mut slot = self.reason.write();
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *slot = Some(reason.into());
            drop(slot);
            self.notify.notify_waiters();

            let callbacks = self.callbacks.read();
            for callback in callbacks.iter() {
                if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback();
                })) {
                    warn!("Cancellation callback panicked: {:?}", e);
                }
            }
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback();
            })) {
                warn!("Cancellation callback panicked: {:?}", e);
            }
        } else {
            self.callbacks.write().push(Box::new(callback));
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Runs `future` unless cancellation wins the race.
    ///
    /// Returns `None` when cancelled; the future is dropped without completing.
    pub async fn run_until_cancelled<F>(&self, future: F) -> Option<F::Output>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancelled() => None,
            output = future => Some(output),
        }
    }

    /// Sleeps for `duration`, returning `false` if cancelled first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.run_until_cancelled(tokio::time::sleep(duration))
            .await
            .is_some()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
