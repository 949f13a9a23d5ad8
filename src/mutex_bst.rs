//! A baseline, lock-based binary search tree.
//!
//! [`MutexBst`] is the straightforward reference structure the lock-free
//! variants in [`crate::bst`] and [`crate::art`] are benchmarked and tested
//! against: a single [`RwLock`]-guarded, key-sorted `Vec`, with one writer
//! at a time and any number of concurrent readers.

use crate::error::OverflowError;
use crate::rwlock::RwLock;

/// A capacity-bounded, mutex-backed sorted map.
pub struct MutexBst<K, V> {
    data: RwLock<Vec<(K, V)>>,
    capacity: usize,
}

/// Capacity used by [`MutexBst::new`].
const DEFAULT_CAPACITY: usize = 1024;

impl<K: Ord + Clone, V: Clone> Default for MutexBst<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> MutexBst<K, V> {
    /// Build an empty tree at the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Build an empty tree that rejects insertions once it holds `capacity`
    /// keys, rounded up to the next power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        MutexBst {
            data: RwLock::new(Vec::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Maximum number of keys this tree will hold, always a power of two.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rebuild the tree with a new capacity (rounded up to the next power of
    /// two), dropping every key currently stored.
    pub fn set_capacity(&mut self, capacity: usize) {
        *self = Self::with_capacity(capacity);
    }

    /// Current number of keys stored.
    pub fn size(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the tree currently holds no keys.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Always `true`: this structure has a fixed capacity.
    pub fn is_bounded(&self) -> bool {
        true
    }

    /// Always `true`: this structure is safe for concurrent use.
    pub fn is_concurrent(&self) -> bool {
        true
    }

    /// Insert `key`/`value`. `Ok(false)` means `key` was already present;
    /// `Err` means the tree is at capacity.
    pub fn add(&self, key: K, value: V) -> Result<bool, OverflowError<(K, V)>> {
        let mut guard = self.data.write();
        match guard.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(_) => Ok(false),
            Err(pos) => {
                if guard.len() >= self.capacity {
                    log::warn!("mutex bst overflow, rejecting insert");
                    return Err(OverflowError::new((key, value)));
                }
                guard.insert(pos, (key, value));
                Ok(true)
            }
        }
    }

    /// Remove `key`, returning its value if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self.data.write();
        guard.binary_search_by(|(k, _)| k.cmp(key)).ok().map(|pos| guard.remove(pos).1)
    }

    /// Whether `key` is present.
    pub fn contain(&self, key: &K) -> bool {
        self.data.read().binary_search_by(|(k, _)| k.cmp(key)).is_ok()
    }

    /// The value stored under `key`, if present.
    pub fn get(&self, key: &K) -> Option<V> {
        let guard = self.data.read();
        guard.binary_search_by(|(k, _)| k.cmp(key)).ok().map(|pos| guard[pos].1.clone())
    }

    /// The smallest key currently stored, if any.
    pub fn find_min_key(&self) -> Option<K> {
        self.data.read().first().map(|(k, _)| k.clone())
    }

    /// Drop every stored key.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    /// A snapshot, forward (ascending-key) iterator over the tree's current
    /// contents.
    pub fn iter(&self) -> std::vec::IntoIter<(K, V)> {
        self.data.read().clone().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tree_is_empty() {
        let t: MutexBst<i32, &str> = MutexBst::with_capacity(4);
        assert!(t.is_empty());
        assert_eq!(t.find_min_key(), None);
    }

    #[test]
    fn add_then_get_and_contain() {
        let t = MutexBst::with_capacity(4);
        assert_eq!(t.add(3, "three"), Ok(true));
        assert!(t.contain(&3));
        assert_eq!(t.get(&3), Some("three"));
    }

    #[test]
    fn add_duplicate_returns_false() {
        let t = MutexBst::with_capacity(4);
        t.add(3, "three").unwrap();
        assert_eq!(t.add(3, "also three"), Ok(false));
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn add_past_capacity_overflows() {
        let t = MutexBst::with_capacity(2);
        t.add(1, "a").unwrap();
        t.add(2, "b").unwrap();
        let err = t.add(3, "c").unwrap_err();
        assert_eq!(err.into_value(), (3, "c"));
    }

    #[test]
    fn iter_yields_ascending_keys() {
        let t = MutexBst::with_capacity(8);
        for k in [5, 1, 3, 2, 4] {
            t.add(k, ()).unwrap();
        }
        let keys: Vec<i32> = t.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn remove_then_min_key_updates() {
        let t = MutexBst::with_capacity(4);
        t.add(1, "a").unwrap();
        t.add(2, "b").unwrap();
        assert_eq!(t.remove(&1), Some("a"));
        assert_eq!(t.find_min_key(), Some(2));
    }

    #[test]
    fn new_uses_default_capacity() {
        let t: MutexBst<i32, &str> = MutexBst::new();
        assert_eq!(t.capacity(), DEFAULT_CAPACITY);
    }
}
