//! Time-bounded record of recent outcomes.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of one guarded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
}

/// Outcome records no older than `window`, with running counts.
#[derive(Debug)]
pub(crate) struct RollingWindow {
    records: VecDeque<(Instant, Outcome)>,
    window: Duration,
    failures: usize,
    successes: usize,
}

impl RollingWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            records: VecDeque::new(),
            window,
            failures: 0,
            successes: 0,
        }
    }

    /// Appends a record, pruning expired ones first.
    pub(crate) fn push(&mut self, now: Instant, outcome: Outcome) {
        self.prune(now);
        self.records.push_back((now, outcome));
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure => self.failures += 1,
        }
    }

    /// Drops records older than the window. Amortized O(1) per record.
    pub(crate) fn prune(&mut self, now: Instant) {
        while let Some(&(recorded_at, outcome)) = self.records.front() {
            if now.saturating_duration_since(recorded_at) <= self.window {
                break;
            }
            self.records.pop_front();
            match outcome {
                Outcome::Success => self.successes -= 1,
                Outcome::Failure => self.failures -= 1,
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.failures = 0;
        self.successes = 0;
    }

    pub(crate) fn failures(&self) -> usize {
        self.failures
    }

    pub(crate) fn successes(&self) -> usize {
        self.successes
    }

    pub(crate) fn total(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn failure_rate(&self) -> f64 {
        if self.records.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.records.len() as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_counts_and_rate() {
        let mut window = RollingWindow::new(Duration::from_secs(10));
        let now = Instant::now();
        window.push(now, Outcome::Failure);
        window.push(now, Outcome::Success);
        window.push(now, Outcome::Failure);
        window.push(now, Outcome::Failure);

        assert_eq!(window.total(), 4);
        assert_eq!(window.failures(), 3);
        assert_eq!(window.successes(), 1);
        assert!((window.failure_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_expires_old_records() {
        let mut window = RollingWindow::new(Duration::from_secs(10));
        window.push(Instant::now(), Outcome::Failure);

        tokio::time::advance(Duration::from_secs(6)).await;
        window.push(Instant::now(), Outcome::Success);

        tokio::time::advance(Duration::from_secs(5)).await;
        window.prune(Instant::now());

        assert_eq!(window.total(), 1);
        assert_eq!(window.failures(), 0);
        assert_eq!(window.successes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_at_window_edge_is_kept() {
        let mut window = RollingWindow::new(Duration::from_secs(10));
        window.push(Instant::now(), Outcome::Failure);

        tokio::time::advance(Duration::from_secs(10)).await;
        window.prune(Instant::now());
        assert_eq!(window.failures(), 1);

        window.clear();
        assert_eq!(window.total(), 0);
        assert_eq!(window.failure_rate(), 0.0);
    }
}
