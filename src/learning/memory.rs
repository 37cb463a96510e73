use std::collections::VecDeque;
use std::collections::vec_deque;

/// FIFO buffer that evicts its oldest entry once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct BoundedMemory<T> {
    entries: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> BoundedMemory<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1_024)),
            capacity,
            evicted: 0,
        }
    }

    /// Append `entry`, returning the evicted entry if the memory was full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.capacity {
            self.evicted += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn oldest(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.entries.iter()
    }
}

impl<'a, T> IntoIterator for &'a BoundedMemory<T> {
    type Item = &'a T;
    type IntoIter = vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut memory = BoundedMemory::new(3);
        for value in 1..=3 {
            assert!(memory.push(value).is_none());
        }
        assert_eq!(memory.push(4), Some(1));
        assert_eq!(memory.len(), 3);
        assert_eq!(memory.oldest(), Some(&2));
        assert_eq!(memory.latest(), Some(&4));
        assert_eq!(memory.evicted(), 1);
    }
}
