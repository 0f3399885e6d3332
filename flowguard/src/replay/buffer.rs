//! Bounded FIFO buffer of node inputs.

use crate::errors::BufferCapacityError;
use serde::{Deserialize, Serialize};

/// Current fill level of a replay buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferOccupancy {
    /// Items held.
    pub current_items: usize,
    /// Maximum items, `None` when unbounded.
    pub capacity: Option<usize>,
}

impl BufferOccupancy {
    /// Fraction of the capacity in use, `None` when unbounded.
    #[must_use]
    pub fn utilization(&self) -> Option<f64> {
        self.capacity.map(|capacity| {
            if capacity == 0 {
                1.0
            } else {
                self.current_items as f64 / capacity as f64
            }
        })
    }
}

/// Records every input a node has consumed so a restarted attempt can be fed
/// the same items in the same order.
///
/// A bounded buffer rejects the item past its capacity and stays unchanged;
/// it never drops old entries.
///
/// The replay cursor walks the items retained at the last [`rewind`], so
/// items appended during a replay pass are not handed out by that pass.
///
/// [`rewind`]: ReplayBuffer::rewind
#[derive(Debug, Clone)]
pub struct ReplayBuffer<T> {
    items: Vec<T>,
    capacity: Option<usize>,
    node_id: Option<String>,
    cursor: usize,
    replay_end: usize,
}

impl<T> ReplayBuffer<T> {
    /// Creates a buffer with an optional capacity.
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: Vec::new(),
            capacity,
            node_id: None,
            cursor: 0,
            replay_end: 0,
        }
    }

    /// Creates a buffer holding at most `capacity` items.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self::new(Some(capacity))
    }

    /// Creates a buffer without a capacity limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Attributes capacity errors to `node_id`.
    #[must_use]
    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Appends an item.
    ///
    /// Fails without modifying the buffer when it is full.
    pub fn append(&mut self, item: T) -> Result<(), BufferCapacityError> {
        if let Some(capacity) = self.capacity {
            if self.items.len() >= capacity {
                let err = BufferCapacityError::new(capacity);
                return Err(match &self.node_id {
                    Some(node_id) => err.with_node(node_id.clone()),
                    None => err,
                });
            }
        }
        self.items.push(item);
        Ok(())
    }

    /// Iterates over the retained items in insertion order.
    ///
    /// Replaying does not consume the buffer and can be repeated.
    pub fn replay(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Returns the number of retained items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the capacity, `None` when unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Returns the current fill level.
    #[must_use]
    pub fn occupancy(&self) -> BufferOccupancy {
        BufferOccupancy {
            current_items: self.items.len(),
            capacity: self.capacity,
        }
    }

    /// Starts a replay pass over the items retained so far.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.replay_end = self.items.len();
    }

    /// Returns true while the current pass has items left to hand out.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.replay_end
    }
}

impl<T: Clone> ReplayBuffer<T> {
    /// Returns a clone of the next item of the current replay pass.
    pub fn next_replayed(&mut self) -> Option<T> {
        if !self.is_replaying() {
            return None;
        }
        let item = self.items.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(item)
    }
}

impl<T> Default for ReplayBuffer<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_replay_yields_items_in_order() {
        let mut buffer = ReplayBuffer::bounded(5);
        for item in ["a", "b", "c"] {
            buffer.append(item).unwrap();
        }

        let first: Vec<_> = buffer.replay().copied().collect();
        let second: Vec<_> = buffer.replay().copied().collect();

        assert_eq!(first, vec!["a", "b", "c"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_append_past_capacity_fails_and_keeps_contents() {
        let mut buffer = ReplayBuffer::bounded(2).for_node("ingest");
        buffer.append(1).unwrap();
        buffer.append(2).unwrap();

        let err = buffer.append(3).unwrap_err();

        assert_eq!(err.capacity, 2);
        assert_eq!(err.node_id.as_deref(), Some("ingest"));
        assert_eq!(buffer.replay().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_zero_capacity_rejects_first_append() {
        let mut buffer = ReplayBuffer::bounded(0);
        assert!(buffer.append(()).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unbounded_accepts_everything() {
        let mut buffer = ReplayBuffer::unbounded();
        for i in 0..10_000 {
            buffer.append(i).unwrap();
        }
        assert_eq!(buffer.len(), 10_000);
        assert_eq!(buffer.occupancy().utilization(), None);
    }

    #[test]
    fn test_replay_pass_excludes_items_appended_during_pass() {
        let mut buffer = ReplayBuffer::bounded(3);
        buffer.append('x').unwrap();
        buffer.append('y').unwrap();
        assert_eq!(buffer.next_replayed(), None);

        buffer.rewind();
        assert_eq!(buffer.next_replayed(), Some('x'));
        buffer.append('z').unwrap();
        assert!(buffer.is_replaying());
        assert_eq!(buffer.next_replayed(), Some('y'));
        assert_eq!(buffer.next_replayed(), None);

        buffer.rewind();
        let replayed: Vec<_> = std::iter::from_fn(|| buffer.next_replayed()).collect();
        assert_eq!(replayed, vec!['x', 'y', 'z']);
    }

    #[test]
    fn test_occupancy() {
        let mut buffer = ReplayBuffer::bounded(4);
        buffer.append(1).unwrap();

        let occupancy = buffer.occupancy();
        assert_eq!(
            occupancy,
            BufferOccupancy {
                current_items: 1,
                capacity: Some(4)
            }
        );
        assert_eq!(occupancy.utilization(), Some(0.25));
    }
}
