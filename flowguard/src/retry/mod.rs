//! Retry budgets and retry delay computation.
//!
//! - [`RetryOptions`] bound item retries and node restarts
//! - [`RetryDelayStrategy`] turns an attempt number into a wait

mod backoff;
mod jitter;
mod options;
mod strategy;

pub use backoff::BackoffStrategy;
pub use jitter::JitterStrategy;
pub use options::{NodeRetryOverrides, RetryOptions};
pub use strategy::{RetryDelayConfig, RetryDelayStrategy};
