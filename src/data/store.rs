use std::collections::BTreeMap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Latest value per key. Sharded, so writers on different keys never contend.
pub struct ValueStore<V> {
    values: DashMap<String, V>,
}

impl<V: Clone> ValueStore<V> {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    pub fn with_values<K, I>(values: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let store = Self::new();
        for (key, value) in values {
            store.values.insert(key.into(), value);
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.values.get(key).map(|value| value.clone())
    }

    // Returns the previous value, if any
    pub fn set(&self, key: &str, value: V) -> Option<V> {
        self.values.insert(key.to_string(), value)
    }

    /// Returns the current value for `key`, inserting `default()` first when the
    /// key is unseen. The flag tells whether the key already existed.
    pub fn get_or_insert_with<F>(&self, key: &str, default: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        match self.values.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                let value = default();
                entry.insert(value.clone());
                (value, false)
            }
        }
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, V> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<V: Clone> Default for ValueStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_missing_key_is_absent_not_error() {
        let store: ValueStore<u32> = ValueStore::new();
        assert_eq!(store.get("AAPL"), None);
        assert!(!store.contains("AAPL"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_creates_and_overwrites() {
        let store = ValueStore::new();
        assert_eq!(store.set("AAPL", 1), None);
        assert_eq!(store.set("AAPL", 2), Some(1));
        assert_eq!(store.get("AAPL"), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_or_insert_with_only_inserts_once() {
        let store = ValueStore::with_values([("AAPL", 150)]);

        assert_eq!(store.get_or_insert_with("AAPL", || 100), (150, true));
        assert_eq!(store.get_or_insert_with("IBM", || 100), (100, false));
        assert_eq!(store.get_or_insert_with("IBM", || 7), (100, true));
    }

    #[test]
    fn test_keys_and_snapshot() {
        let store = ValueStore::with_values([("MSFT", 280), ("AAPL", 150)]);
        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["AAPL".to_string(), "MSFT".to_string()]);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.get("AAPL"), Some(&150));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_concurrent_writers_on_distinct_keys() {
        let store = Arc::new(ValueStore::new());
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let key = format!("K{}", i);
                    for n in 0..1000 {
                        store.set(&key, n);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(store.len(), 8);
        assert!(store.snapshot().values().all(|v| *v == 999));
    }
}
