//! Cooperative cancellation shared by every suspension point of a node run.

mod token;

pub use token::{CancelCallback, CancellationToken};
