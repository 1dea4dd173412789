//! Write-through in-memory caches fronting the persisted tables.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

/// One table's cache.  Values are inserted on read-miss and on every
/// successful write; `clear` wipes the map so the next read reloads
/// from disk after a failed write batch.
pub(crate) struct TableCache<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TableCache<K, V> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.read().get(key).cloned()
    }

    /// Cached value, or the result of `load` (cached on success).
    pub fn get_or_load<E>(
        &self,
        key: &K,
        load: impl FnOnce() -> Result<Option<V>, E>,
    ) -> Result<Option<V>, E> {
        if let Some(hit) = self.get(key) {
            return Ok(Some(hit));
        }

        let loaded = load()?;
        if let Some(value) = &loaded {
            self.map.write().insert(key.clone(), value.clone());
        }
        Ok(loaded)
    }

    pub fn put(&self, key: K, value: V) {
        self.map.write().insert(key, value);
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}
