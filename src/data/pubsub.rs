use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use log::{debug, info};

use crate::data::listener::{ListenerHandle, ListenerId};
use crate::data::store::ValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    // At most one handle per key, last subscribe wins
    Single,
    // Any number of distinct handles per key
    Multi,
}

// Produces the value for a key seen for the first time on subscribe
pub type DefaultValue<V> = Arc<dyn Fn(&str) -> V + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription<V> {
    pub value: V,
    pub existed_before: bool,
    // Handle displaced by a single-cardinality subscribe
    pub replaced: Option<ListenerId>,
}

/// One handle registered under one key. `generation` is fresh for every
/// successful subscribe, so a stale failure cannot evict a later registration.
#[derive(Debug, Clone)]
pub struct Registration<V> {
    pub handle: ListenerHandle<V>,
    pub generation: u64,
}

/// Per-key listener collections backed by a sharded map: one key's collection is
/// only ever mutated under that key's shard lock, other keys proceed in parallel.
pub struct ListenerRegistry<V> {
    listeners: DashMap<String, Vec<Registration<V>>>,
    next_generation: AtomicU64,
    store: Arc<ValueStore<V>>,
    cardinality: Cardinality,
    default_value: DefaultValue<V>,
}

impl<V: Clone> ListenerRegistry<V> {
    pub fn new(store: Arc<ValueStore<V>>, cardinality: Cardinality, default_value: DefaultValue<V>) -> Self {
        Self {
            listeners: DashMap::new(),
            next_generation: AtomicU64::new(0),
            store,
            cardinality,
            default_value,
        }
    }

    /// Registers `handle` under `key` and returns the value to push right away.
    ///
    /// The key's entry stays locked while the store is consulted, so the returned
    /// value and the registration are observed together by the broadcaster.
    pub fn subscribe(&self, key: &str, handle: ListenerHandle<V>) -> Subscription<V> {
        let mut handles = self.listeners.entry(key.to_string()).or_default();
        let mut replaced = None;

        match self.cardinality {
            Cardinality::Multi => {
                if handles.iter().any(|existing| existing.handle.id() == handle.id()) {
                    debug!("Listener {} already registered for {}", handle.id().short(), key);
                } else {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    handles.push(Registration { handle, generation });
                }
            }
            Cardinality::Single => {
                replaced = handles
                    .first()
                    .map(|existing| existing.handle.id())
                    .filter(|id| *id != handle.id());
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                handles.clear();
                handles.push(Registration { handle, generation });
            }
        }

        let (value, existed_before) = self
            .store
            .get_or_insert_with(key, || (self.default_value)(key));
        drop(handles);

        if !existed_before {
            info!("Added new key: {}", key);
        }
        if let Some(id) = replaced {
            info!("Listener {} replaced on {}", id.short(), key);
        }

        Subscription {
            value,
            existed_before,
            replaced,
        }
    }

    /// Removes `id` from `key`. Drops the key entirely once its last listener is gone.
    /// Returns whether anything was removed; unknown keys or ids are a no-op.
    pub fn unsubscribe(&self, key: &str, id: ListenerId) -> bool {
        self.remove_where(key, |registration| registration.handle.id() == id)
    }

    /// Removes `id` from `key` only if it is still the registration that was
    /// snapshotted as `generation`. Used for eviction after a failed push.
    pub fn evict(&self, key: &str, id: ListenerId, generation: u64) -> bool {
        self.remove_where(key, |registration| {
            registration.handle.id() == id && registration.generation == generation
        })
    }

    fn remove_where<F>(&self, key: &str, matches: F) -> bool
    where
        F: Fn(&Registration<V>) -> bool,
    {
        let Entry::Occupied(mut entry) = self.listeners.entry(key.to_string()) else {
            return false;
        };

        let handles = entry.get_mut();
        let before = handles.len();
        handles.retain(|registration| !matches(registration));
        let removed = handles.len() != before;

        if handles.is_empty() {
            entry.remove();
            debug!("Removed empty listener list for {}", key);
        }
        removed
    }

    /// Point-in-time copy of the registrations for `key`. No lock is held once this returns.
    pub fn snapshot(&self, key: &str) -> Vec<Registration<V>> {
        self.listeners
            .get(key)
            .map(|handles| handles.value().clone())
            .unwrap_or_default()
    }

    // Re-enumerated on every call
    pub fn keys_with_listeners(&self) -> Vec<String> {
        self.listeners
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn is_subscribed(&self, key: &str, id: ListenerId) -> bool {
        self.listeners
            .get(key)
            .map(|handles| handles.iter().any(|registration| registration.handle.id() == id))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn listener_count(&self, key: &str) -> usize {
        self.listeners.get(key).map(|handles| handles.len()).unwrap_or(0)
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    // (keys with listeners, total registrations)
    pub fn get_stats(&self) -> (usize, usize) {
        let registrations = self.listeners.iter().map(|entry| entry.value().len()).sum();
        (self.listeners.len(), registrations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::listener::testing::SwitchListener;
    use crate::data::listener::Listener;

    fn registry(cardinality: Cardinality) -> (Arc<ValueStore<u32>>, ListenerRegistry<u32>) {
        let store = Arc::new(ValueStore::new());
        let registry = ListenerRegistry::new(store.clone(), cardinality, Arc::new(|_: &str| 100u32));
        (store, registry)
    }

    fn handle() -> ListenerHandle<u32> {
        let listener: Arc<dyn Listener<u32>> = SwitchListener::healthy();
        ListenerHandle::new(listener)
    }

    fn handles(registry: &ListenerRegistry<u32>, key: &str) -> Vec<ListenerHandle<u32>> {
        registry
            .snapshot(key)
            .into_iter()
            .map(|registration| registration.handle)
            .collect()
    }

    #[test]
    fn test_subscribe_unseen_key_creates_default_value() {
        let (store, registry) = registry(Cardinality::Multi);
        let h1 = handle();

        let subscription = registry.subscribe("AAPL", h1.clone());

        assert_eq!(subscription.value, 100);
        assert!(!subscription.existed_before);
        assert_eq!(store.get("AAPL"), Some(100));
        assert!(registry.is_subscribed("AAPL", h1.id()));
    }

    #[test]
    fn test_subscribe_existing_key_returns_current_value() {
        let (store, registry) = registry(Cardinality::Multi);
        store.set("AAPL", 150);

        let subscription = registry.subscribe("AAPL", handle());

        assert_eq!(subscription.value, 150);
        assert!(subscription.existed_before);
    }

    #[test]
    fn test_multi_ignores_duplicate_handle() {
        let (_, registry) = registry(Cardinality::Multi);
        let h1 = handle();
        let h2 = handle();

        registry.subscribe("GOOGL", h1.clone());
        registry.subscribe("GOOGL", h1.clone());
        registry.subscribe("GOOGL", h2.clone());

        let ids: Vec<_> = handles(&registry, "GOOGL").iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![h1.id(), h2.id()]);
    }

    #[test]
    fn test_single_last_subscribe_wins() {
        let (_, registry) = registry(Cardinality::Single);
        let h1 = handle();
        let h2 = handle();

        assert_eq!(registry.subscribe("config", h1.clone()).replaced, None);
        assert_eq!(registry.subscribe("config", h2.clone()).replaced, Some(h1.id()));
        // Re-subscribing the current holder replaces nobody
        assert_eq!(registry.subscribe("config", h2.clone()).replaced, None);

        assert_eq!(handles(&registry, "config"), vec![h2.clone()]);
        assert!(!registry.is_subscribed("config", h1.id()));
    }

    #[test]
    fn test_unsubscribe_last_handle_removes_key_but_keeps_value() {
        let (store, registry) = registry(Cardinality::Multi);
        let h1 = handle();
        registry.subscribe("AAPL", h1.clone());

        assert!(registry.unsubscribe("AAPL", h1.id()));

        assert!(registry.keys_with_listeners().is_empty());
        assert_eq!(registry.get_stats(), (0, 0));
        assert_eq!(store.get("AAPL"), Some(100));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let (_, registry) = registry(Cardinality::Multi);
        let h1 = handle();
        let h2 = handle();
        registry.subscribe("AAPL", h1.clone());
        registry.subscribe("AAPL", h2.clone());

        assert!(registry.unsubscribe("AAPL", h1.id()));
        let after_once = handles(&registry, "AAPL");
        assert!(!registry.unsubscribe("AAPL", h1.id()));

        assert_eq!(handles(&registry, "AAPL"), after_once);
        assert_eq!(registry.keys_with_listeners(), vec!["AAPL".to_string()]);
    }

    #[test]
    fn test_unsubscribe_unknown_key_is_noop() {
        let (store, registry) = registry(Cardinality::Multi);
        assert!(!registry.unsubscribe("NOPE", handle().id()));
        assert!(registry.keys_with_listeners().is_empty());
        assert!(!store.contains("NOPE"));
    }

    #[test]
    fn test_registration_state_follows_last_operation() {
        let (_, registry) = registry(Cardinality::Multi);
        let h1 = handle();
        let id = h1.id();

        registry.subscribe("TSLA", h1.clone());
        registry.unsubscribe("TSLA", id);
        registry.subscribe("TSLA", h1.clone());
        assert!(registry.is_subscribed("TSLA", id));

        registry.unsubscribe("TSLA", id);
        registry.unsubscribe("TSLA", id);
        assert!(!registry.is_subscribed("TSLA", id));
    }

    #[test]
    fn test_snapshot_is_detached_from_later_changes() {
        let (_, registry) = registry(Cardinality::Multi);
        let h1 = handle();
        registry.subscribe("MSFT", h1.clone());

        let snapshot = handles(&registry, "MSFT");
        registry.subscribe("MSFT", handle());
        registry.unsubscribe("MSFT", h1.id());

        assert_eq!(snapshot, vec![h1]);
        assert_eq!(registry.listener_count("MSFT"), 1);
    }

    #[test]
    fn test_concurrent_subscribe_unsubscribe_same_key() {
        let (_, registry) = registry(Cardinality::Multi);
        let registry = Arc::new(registry);
        let keepers: Vec<_> = (0..4).map(|_| handle()).collect();

        let workers: Vec<_> = keepers
            .iter()
            .cloned()
            .map(|keeper| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let transient = handle();
                        registry.subscribe("AMZN", transient.clone());
                        registry.subscribe("AMZN", keeper.clone());
                        registry.unsubscribe("AMZN", transient.id());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let snapshot = handles(&registry, "AMZN");
        assert_eq!(snapshot.len(), keepers.len());
        for keeper in &keepers {
            assert!(snapshot.contains(keeper));
        }
    }

    #[test]
    fn test_evict_ignores_stale_generation() {
        let (_, registry) = registry(Cardinality::Multi);
        let h1 = handle();
        registry.subscribe("NVDA", h1.clone());
        let stale = registry.snapshot("NVDA")[0].generation;

        // Listener left and came back while a push to the old registration was failing
        registry.unsubscribe("NVDA", h1.id());
        registry.subscribe("NVDA", h1.clone());

        assert!(!registry.evict("NVDA", h1.id(), stale));
        assert!(registry.is_subscribed("NVDA", h1.id()));

        let current = registry.snapshot("NVDA")[0].generation;
        assert!(registry.evict("NVDA", h1.id(), current));
        assert!(registry.keys_with_listeners().is_empty());
    }
}
