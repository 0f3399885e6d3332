//! Input materialization for node restarts.

mod buffer;

pub use buffer::{BufferOccupancy, ReplayBuffer};
