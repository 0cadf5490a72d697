//! Fixed-capacity FIFO with key lookup.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Keeps the newest `capacity` items; pushing into a full buffer evicts the
/// oldest one and counts it as overflow.
#[derive(Debug, Clone)]
pub struct RingBuffer<K, V> {
    items: VecDeque<(K, V)>,
    /// Absolute position of each key's most recent item.
    index: HashMap<K, u64>,
    /// Absolute position of `items[0]`.
    head: u64,
    capacity: usize,
    overflow: u64,
}

impl<K, V> RingBuffer<K, V>
where
    K: Eq + Hash + Clone,
{
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            head: 0,
            capacity,
            overflow: 0,
        }
    }

    /// Appends an item, returning the evicted one if the buffer was full.
    pub fn push(&mut self, key: K, value: V) -> Option<(K, V)> {
        let evicted = if self.items.len() == self.capacity {
            self.pop_front()
        } else {
            None
        };
        if evicted.is_some() {
            self.overflow += 1;
        }
        let pos = self.head + self.items.len() as u64;
        self.index.insert(key.clone(), pos);
        self.items.push_back((key, value));
        evicted
    }

    fn pop_front(&mut self) -> Option<(K, V)> {
        let (key, value) = self.items.pop_front()?;
        if self.index.get(&key) == Some(&self.head) {
            self.index.remove(&key);
        }
        self.head += 1;
        Some((key, value))
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let pos = *self.index.get(key)?;
        let offset = usize::try_from(pos.checked_sub(self.head)?).ok()?;
        self.items.get(offset).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn front(&self) -> Option<(&K, &V)> {
        self.items.front().map(|(k, v)| (k, v))
    }

    pub fn back(&self) -> Option<(&K, &V)> {
        self.items.back().map(|(k, v)| (k, v))
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.items.iter().map(|(k, v)| (k, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.items.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted by pushes since creation.
    pub fn overflow_count(&self) -> u64 {
        self.overflow
    }

    pub fn clear(&mut self) {
        self.head += self.items.len() as u64;
        self.items.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut buf = RingBuffer::new(3);
        for i in 1..=3u64 {
            assert!(buf.push(i, i * 10).is_none());
        }
        assert_eq!(buf.push(4, 40), Some((1, 10)));
        assert_eq!(buf.overflow_count(), 1);
        assert_eq!(buf.front(), Some((&2, &20)));
        assert_eq!(buf.back(), Some((&4, &40)));
        assert!(buf.get(&1).is_none());
        assert_eq!(buf.get(&3), Some(&30));
    }

    #[test]
    fn lookup_survives_wraparound() {
        let mut buf = RingBuffer::new(2);
        for i in 0..100u64 {
            buf.push(i, i);
        }
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.get(&99), Some(&99));
        assert_eq!(buf.get(&98), Some(&98));
        assert!(!buf.contains(&97));
        assert_eq!(buf.overflow_count(), 98);
    }

    #[test]
    fn duplicate_key_points_to_newest() {
        let mut buf = RingBuffer::new(3);
        buf.push("a", 1);
        buf.push("a", 2);
        assert_eq!(buf.get(&"a"), Some(&2));
        buf.push("b", 3);
        buf.push("c", 4);
        // The first "a" is evicted; the second is still addressable.
        assert_eq!(buf.get(&"a"), Some(&2));
    }

    #[test]
    fn zero_capacity_holds_one() {
        let mut buf = RingBuffer::new(0);
        buf.push(1, ());
        buf.push(2, ());
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.values().count(), 1);
    }

    #[test]
    fn clear_keeps_positions_consistent() {
        let mut buf = RingBuffer::new(2);
        buf.push(1, 1);
        buf.clear();
        assert!(buf.is_empty());
        buf.push(2, 2);
        assert_eq!(buf.get(&2), Some(&2));
    }
}
