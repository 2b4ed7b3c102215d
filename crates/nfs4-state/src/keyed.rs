//! Per-key synchronized collections.
//!
//! Every key owns its own mutex-protected `Vec`, so work on unrelated keys
//! never contends. A collection that becomes empty is dropped from the map
//! while its mutex is still held; a caller that raced with the removal
//! notices that the collection it locked is no longer the one in the map and
//! retries against a fresh one.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

type Slot<V> = Arc<Mutex<Vec<V>>>;

/// Map from key to an independently locked collection of values.
pub struct KeyedCollections<K, V> {
    map: DashMap<K, Slot<V>>,
}

impl<K, V> KeyedCollections<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    fn slot(&self, key: &K) -> Slot<V> {
        // clone the Arc out so no shard lock is held while we wait on the slot
        self.map.entry(key.clone()).or_default().value().clone()
    }

    fn is_current(&self, key: &K, slot: &Slot<V>) -> bool {
        self.map
            .get(key)
            .map(|current| Arc::ptr_eq(current.value(), slot))
            .unwrap_or(false)
    }

    fn drop_if_empty(&self, key: &K, slot: &Slot<V>, items: &[V]) {
        if items.is_empty() {
            self.map.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
        }
    }

    /// Runs `f` with exclusive access to the collection for `key`, creating
    /// it if absent.
    pub fn with_collection<R>(&self, key: &K, f: impl FnOnce(&mut Vec<V>) -> R) -> R {
        let mut slot = self.slot(key);
        loop {
            let mut items = slot.lock();
            if self.is_current(key, &slot) {
                let result = f(&mut items);
                self.drop_if_empty(key, &slot, &items);
                return result;
            }
            drop(items);
            slot = self.slot(key);
        }
    }

    /// Runs `f` with exclusive access to the collection for `key` if one
    /// exists. Returns `None` without calling `f` otherwise.
    pub fn with_existing<R>(&self, key: &K, f: impl FnOnce(&mut Vec<V>) -> R) -> Option<R> {
        loop {
            let slot = self.map.get(key)?.value().clone();
            let mut items = slot.lock();
            if self.is_current(key, &slot) {
                let result = f(&mut items);
                self.drop_if_empty(key, &slot, &items);
                return Some(result);
            }
        }
    }

    /// Drops the whole collection for `key`.
    pub fn remove_all(&self, key: &K) -> Vec<V> {
        self.with_existing(key, std::mem::take).unwrap_or_default()
    }

    /// Number of keys with a non-empty collection.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no key holds any value.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K, V> KeyedCollections<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Copy of the collection for `key`.
    pub fn snapshot(&self, key: &K) -> Vec<V> {
        self.with_existing(key, |items| items.clone())
            .unwrap_or_default()
    }
}

impl<K, V> Default for KeyedCollections<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
