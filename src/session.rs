//! Opaque per-connection session storage
//!
//! A connection carries a small key/value store the application owns; the
//! engine never looks inside it. [`SessionMap`] is the single-lock default;
//! [`ConcurrentMap`] shards by key hash for storages shared across many
//! connections.

use std::any::Any;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::Mutex;

/// Value type held by a session storage
pub type SessionValue = Arc<dyn Any + Send + Sync>;

/// Key/value store attached to a connection
pub trait SessionStorage: Send + Sync {
    /// Number of stored entries
    fn len(&self) -> usize;

    /// Whether the storage is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch the value for `key`
    fn load(&self, key: &str) -> Option<SessionValue>;

    /// Insert or replace the value for `key`
    fn store(&self, key: &str, value: SessionValue);

    /// Remove the value for `key`
    fn delete(&self, key: &str);

    /// Visit entries until `f` returns `false`
    fn range(&self, f: &mut dyn FnMut(&str, &SessionValue) -> bool);
}

/// Single-mutex map; the default session storage
#[derive(Default)]
pub struct SessionMap {
    data: Mutex<HashMap<String, SessionValue>>,
}

impl SessionMap {
    /// Create an empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for SessionMap {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn load(&self, key: &str) -> Option<SessionValue> {
        self.data.lock().get(key).cloned()
    }

    fn store(&self, key: &str, value: SessionValue) {
        self.data.lock().insert(key.to_owned(), value);
    }

    fn delete(&self, key: &str) {
        self.data.lock().remove(key);
    }

    fn range(&self, f: &mut dyn FnMut(&str, &SessionValue) -> bool) {
        let data = self.data.lock();
        for (k, v) in data.iter() {
            if !f(k, v) {
                return;
            }
        }
    }
}

/// Hash-sharded concurrent map.
///
/// The shard count is rounded up to a power of two and keys are routed by
/// hash masked against `shards - 1`. Every shard has its own mutex, so
/// distinct keys mostly proceed without contention.
pub struct ConcurrentMap<K, V> {
    hasher: RandomState,
    shards: Vec<Mutex<HashMap<K, V>>>,
}

impl<K: Hash + Eq, V> ConcurrentMap<K, V> {
    /// Create a map with at least `shards` shards (default 16 when 0)
    pub fn new(shards: usize) -> Self {
        let num = if shards == 0 { 16 } else { shards }.next_power_of_two();
        Self {
            hasher: RandomState::new(),
            shards: (0..num).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, V>> {
        let hash = self.hasher.hash_one(key);
        &self.shards[hash as usize & (self.shards.len() - 1)]
    }

    /// Number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Whether the map holds no entries
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    /// Fetch a clone of the value for `key`
    pub fn load(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard(key).lock().get(key).cloned()
    }

    /// Insert or replace the value for `key`
    pub fn store(&self, key: K, value: V) {
        self.shard(&key).lock().insert(key, value);
    }

    /// Remove the value for `key`
    pub fn delete(&self, key: &K) {
        self.shard(key).lock().remove(key);
    }

    /// Visit entries shard by shard until `f` returns `false`
    pub fn range(&self, mut f: impl FnMut(&K, &V) -> bool) {
        for shard in &self.shards {
            let shard = shard.lock();
            for (k, v) in shard.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }
}

impl SessionStorage for ConcurrentMap<String, SessionValue> {
    fn len(&self) -> usize {
        ConcurrentMap::len(self)
    }

    fn load(&self, key: &str) -> Option<SessionValue> {
        let hash = self.hasher.hash_one(key);
        self.shards[hash as usize & (self.shards.len() - 1)]
            .lock()
            .get(key)
            .cloned()
    }

    fn store(&self, key: &str, value: SessionValue) {
        ConcurrentMap::store(self, key.to_owned(), value);
    }

    fn delete(&self, key: &str) {
        let hash = self.hasher.hash_one(key);
        self.shards[hash as usize & (self.shards.len() - 1)]
            .lock()
            .remove(key);
    }

    fn range(&self, f: &mut dyn FnMut(&str, &SessionValue) -> bool) {
        for shard in &self.shards {
            let shard = shard.lock();
            for (k, v) in shard.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(n: u32) -> SessionValue {
        Arc::new(n)
    }

    fn storage_smoke(storage: &dyn SessionStorage) {
        assert_eq!(storage.len(), 0);
        assert!(storage.is_empty());

        storage.store("user", value(7));
        storage.store("room", value(11));
        assert_eq!(storage.len(), 2);

        let user = storage.load("user").unwrap();
        assert_eq!(user.downcast_ref::<u32>(), Some(&7));
        assert!(storage.load("missing").is_none());

        storage.store("user", value(8));
        assert_eq!(storage.len(), 2);
        assert_eq!(
            storage.load("user").unwrap().downcast_ref::<u32>(),
            Some(&8)
        );

        storage.delete("room");
        assert_eq!(storage.len(), 1);

        let mut seen = Vec::new();
        storage.range(&mut |k, _| {
            seen.push(k.to_owned());
            true
        });
        assert_eq!(seen, vec!["user".to_owned()]);
    }

    #[test]
    fn test_session_map() {
        storage_smoke(&SessionMap::new());
    }

    #[test]
    fn test_concurrent_map_as_storage() {
        storage_smoke(&ConcurrentMap::<String, SessionValue>::new(4));
    }

    #[test]
    fn test_shard_count_rounds_up() {
        let m = ConcurrentMap::<String, u32>::new(10);
        assert_eq!(m.shards.len(), 16);
        let m = ConcurrentMap::<String, u32>::new(0);
        assert_eq!(m.shards.len(), 16);
        let m = ConcurrentMap::<String, u32>::new(4);
        assert_eq!(m.shards.len(), 4);
    }

    #[test]
    fn test_concurrent_map_spreads_and_finds_keys() {
        let m = ConcurrentMap::<String, u32>::new(8);
        for i in 0..500u32 {
            m.store(format!("key-{i}"), i);
        }
        assert_eq!(m.len(), 500);
        for i in 0..500u32 {
            assert_eq!(m.load(&format!("key-{i}")), Some(i));
        }

        let mut count = 0;
        m.range(|_, _| {
            count += 1;
            count < 100
        });
        assert_eq!(count, 100, "range must stop when the visitor says so");
    }
}
