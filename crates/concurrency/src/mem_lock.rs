//! Striped in-memory key locks (§5 concurrency model), used by the write
//! processors in `graphstore-primitives` to serialize concurrent mutations
//! to the same vertex or edge while distinct keys proceed independently.
//!
//! Grounded in the source `VerticesMemLock`/`EdgesMemLock` (constructed
//! once per `StorageEnv` and shared by every write processor): a process
//! wants "don't let two in-flight requests both touch vertex V" without
//! serializing unrelated vertices behind one mutex. [`dashmap`] gives us
//! that directly — each shard has its own lock, so contention is limited
//! to keys that actually collide.

use std::hash::Hash;

use dashmap::DashMap;

/// A set of keys currently locked by an in-flight write. Unlocks every key
/// it holds when dropped.
pub struct LockGuard<'a, K: Eq + Hash> {
    table: &'a MemLock<K>,
    keys: Vec<K>,
}

impl<'a, K: Eq + Hash + Clone> Drop for LockGuard<'a, K> {
    fn drop(&mut self) {
        for key in &self.keys {
            self.table.map.remove(key);
        }
    }
}

/// A striped lock table keyed by vertex id or edge key bytes.
///
/// `K` is typically `Vec<u8>` (an encoded key from `graphstore_core::key`).
pub struct MemLock<K: Eq + Hash> {
    map: DashMap<K, ()>,
}

impl<K: Eq + Hash> Default for MemLock<K> {
    fn default() -> Self {
        Self { map: DashMap::new() }
    }
}

impl<K: Eq + Hash + Clone + Ord> MemLock<K> {
    /// An empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to lock every key in `keys` atomically: either all of them
    /// are acquired, or none are (existing locks are rolled back and
    /// `None` is returned). Keys are sorted before acquisition so two
    /// concurrent batches that share several keys can never deadlock each
    /// other waiting on a lock the other holds — they simply contend on
    /// the first shared key and one of them loses the race.
    pub fn try_lock_all(&self, mut keys: Vec<K>) -> Option<LockGuard<'_, K>> {
        keys.sort();
        keys.dedup();
        let mut acquired = Vec::with_capacity(keys.len());
        for key in &keys {
            if self.map.insert(key.clone(), ()).is_some() {
                for held in &acquired {
                    self.map.remove(held);
                }
                return None;
            }
            acquired.push(key.clone());
        }
        Some(LockGuard { table: self, keys: acquired })
    }

    /// Whether `key` is currently locked.
    pub fn is_locked(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Number of keys currently locked.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no keys are currently locked.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
