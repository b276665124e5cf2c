//! Cache for extended keys: keys longer than a database's inline key size
//! spill their tail into a blob, and re-reading that blob on every compare
//! would be painful. Entries are keyed by the spill blob's id and dropped
//! when the blob dies.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Soft cap on cached key bytes; the whole cache is dropped when crossed.
const DEFAULT_BUDGET: usize = 512 * 1024;

pub struct ExtKeyCache {
    inner: Mutex<Inner>,
}

struct Inner {
    keys: HashMap<u64, Vec<u8>>,
    used: usize,
    budget: usize,
}

impl ExtKeyCache {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_BUDGET)
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                keys: HashMap::new(),
                used: 0,
                budget,
            }),
        }
    }

    /// Caches the full key bytes for a spill blob.
    pub fn insert(&self, blob_id: u64, key: Vec<u8>) {
        let mut inner = self.inner.lock();
        if inner.used + key.len() > inner.budget {
            inner.used = 0;
            inner.keys.clear();
        }
        inner.used += key.len();
        if let Some(old) = inner.keys.insert(blob_id, key) {
            inner.used -= old.len();
        }
    }

    pub fn fetch(&self, blob_id: u64) -> Option<Vec<u8>> {
        self.inner.lock().keys.get(&blob_id).cloned()
    }

    /// Invalidates the entry for a blob that is about to be freed.
    pub fn remove(&self, blob_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.keys.remove(&blob_id) {
            inner.used -= old.len();
        }
    }
}

impl Default for ExtKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_fetch_remove() {
        let cache = ExtKeyCache::new();
        cache.insert(42, b"a rather long key".to_vec());
        assert_eq!(cache.fetch(42).as_deref(), Some(b"a rather long key".as_ref()));
        cache.remove(42);
        assert!(cache.fetch(42).is_none());
    }

    #[test]
    fn overflowing_the_budget_drops_everything() {
        let cache = ExtKeyCache::with_budget(64);
        cache.insert(1, vec![0u8; 40]);
        cache.insert(2, vec![0u8; 40]);
        assert!(cache.fetch(1).is_none());
        assert!(cache.fetch(2).is_some());
    }
}
