use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed-capacity series; pushing at capacity evicts the oldest sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingHistory<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RollingHistory<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.samples.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_capacity_and_drops_oldest_first() {
        let mut h = RollingHistory::new(30);
        for i in 0..100 {
            h.push(i);
            assert!(h.len() <= 30);
            assert_eq!(h.latest(), Some(&i));
        }
        let v = h.to_vec();
        assert_eq!(v.len(), 30);
        assert_eq!(v[0], 70);
        assert_eq!(v[29], 99);
    }

    #[test]
    fn under_capacity_keeps_everything() {
        let mut h = RollingHistory::new(5);
        h.push("a");
        h.push("b");
        assert_eq!(h.to_vec(), vec!["a", "b"]);
        assert_eq!(h.capacity(), 5);
    }
}
