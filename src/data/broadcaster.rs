use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};

use crate::data::listener::ListenerId;
use crate::data::pubsub::ListenerRegistry;
use crate::data::store::ValueStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub keys: usize,
    pub delivered: usize,
    pub evicted: usize,
}

/// Pushes the current value of every watched key to its listeners and evicts
/// the listeners whose push failed.
pub struct Broadcaster<V> {
    store: Arc<ValueStore<V>>,
    registry: Arc<ListenerRegistry<V>>,
    push_timeout: Duration,
    deliveries: DashMap<String, u64>,
    evictions: AtomicU64,
}

impl<V> Broadcaster<V>
where
    V: Clone + Display + Send + Sync,
{
    pub fn new(store: Arc<ValueStore<V>>, registry: Arc<ListenerRegistry<V>>, push_timeout: Duration) -> Self {
        Self {
            store,
            registry,
            push_timeout,
            deliveries: DashMap::new(),
            evictions: AtomicU64::new(0),
        }
    }

    pub async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for key in self.registry.keys_with_listeners() {
            let Some(value) = self.store.get(&key) else {
                warn!("No value for watched key {}, skipping", key);
                continue;
            };

            let registrations = self.registry.snapshot(&key);
            if registrations.is_empty() {
                continue;
            }
            report.keys += 1;

            // One slow or dead listener must not hold up the others
            let timeout = self.push_timeout;
            let outcomes = join_all(registrations.iter().map(|registration| {
                let key = key.as_str();
                let value = &value;
                async move {
                    let outcome = registration.handle.push(key, value, timeout).await;
                    (registration.handle.id(), registration.generation, outcome)
                }
            }))
            .await;

            let mut delivered = 0;
            let mut failed: Vec<(ListenerId, u64)> = Vec::new();
            for (id, generation, outcome) in outcomes {
                match outcome {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!("Failed to notify listener {} of {}: {}", id.short(), key, e);
                        failed.push((id, generation));
                    }
                }
            }

            if delivered > 0 {
                let mut total = self.deliveries.entry(key.clone()).or_insert(0);
                *total += delivered as u64;
                debug!("Notified {} listeners of {} = {} ({} total)", delivered, key, value, *total);
            }

            let mut evicted = 0;
            // A registration renewed since the snapshot keeps its place
            for (id, generation) in failed {
                if self.registry.evict(&key, id, generation) {
                    evicted += 1;
                }
            }
            if evicted > 0 {
                self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                info!("Removed {} dead listener(s) for {}", evicted, key);
            }

            report.delivered += delivered;
            report.evicted += evicted;
        }

        report
    }

    #[cfg(test)]
    pub fn delivery_count(&self, key: &str) -> u64 {
        self.deliveries.get(key).map(|count| *count).unwrap_or(0)
    }

    pub fn total_deliveries(&self) -> u64 {
        self.deliveries.iter().map(|entry| *entry.value()).sum()
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use async_trait::async_trait;
    use crate::data::listener::testing::{RecordingListener, StalledListener, SwitchListener};
    use crate::data::listener::{DeliveryError, Listener, ListenerHandle};
    use crate::data::pubsub::Cardinality;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<ValueStore<Decimal>>,
        registry: Arc<ListenerRegistry<Decimal>>,
        broadcaster: Broadcaster<Decimal>,
    }

    fn fixture(push_timeout: Duration) -> Fixture {
        let store = Arc::new(ValueStore::new());
        let registry = Arc::new(ListenerRegistry::new(
            store.clone(),
            Cardinality::Multi,
            Arc::new(|_: &str| dec!(100.00)),
        ));
        let broadcaster = Broadcaster::new(store.clone(), registry.clone(), push_timeout);
        Fixture {
            store,
            registry,
            broadcaster,
        }
    }

    fn handle_for(listener: Arc<dyn Listener<Decimal>>) -> ListenerHandle<Decimal> {
        ListenerHandle::new(listener)
    }

    #[tokio::test]
    async fn test_delivers_current_value_to_every_listener() {
        let f = fixture(Duration::from_secs(1));
        let r1 = RecordingListener::<Decimal>::new();
        let r2 = RecordingListener::<Decimal>::new();
        f.store.set("AAPL", dec!(150.00));
        f.registry.subscribe("AAPL", handle_for(r1.clone()));
        f.registry.subscribe("AAPL", handle_for(r2.clone()));

        // Updater moved the price before the tick
        f.store.set("AAPL", dec!(151.23));
        let report = f.broadcaster.run_tick().await;

        assert_eq!(report, TickReport { keys: 1, delivered: 2, evicted: 0 });
        assert_eq!(r1.received(), vec![("AAPL".to_string(), dec!(151.23))]);
        assert_eq!(r2.received(), vec![("AAPL".to_string(), dec!(151.23))]);
        assert_eq!(f.broadcaster.delivery_count("AAPL"), 2);
    }

    #[tokio::test]
    async fn test_failed_listener_is_evicted_others_kept() {
        let f = fixture(Duration::from_secs(1));
        let broken = SwitchListener::broken();
        let healthy = RecordingListener::<Decimal>::new();
        let h1 = handle_for(broken.clone());
        let h2 = handle_for(healthy.clone());
        f.registry.subscribe("GOOGL", h1.clone());
        f.registry.subscribe("GOOGL", h2.clone());

        let report = f.broadcaster.run_tick().await;

        assert_eq!(report.evicted, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(f.registry.keys_with_listeners(), vec!["GOOGL".to_string()]);
        let remaining: Vec<_> = f.registry.snapshot("GOOGL").into_iter().map(|r| r.handle).collect();
        assert_eq!(remaining, vec![h2]);
        assert_eq!(healthy.count(), 1);
        assert_eq!(f.broadcaster.eviction_count(), 1);
    }

    #[tokio::test]
    async fn test_eviction_happens_in_the_failing_tick() {
        let f = fixture(Duration::from_secs(1));
        let listener = SwitchListener::healthy();
        let handle = handle_for(listener.clone());
        f.registry.subscribe("TSLA", handle.clone());

        f.broadcaster.run_tick().await;
        f.broadcaster.run_tick().await;
        assert!(f.registry.is_subscribed("TSLA", handle.id()));

        listener.set_healthy(false);
        f.broadcaster.run_tick().await;
        assert!(!f.registry.is_subscribed("TSLA", handle.id()));

        // Evicted listeners are never called again
        f.broadcaster.run_tick().await;
        assert_eq!(listener.attempts(), 3);
    }

    #[tokio::test]
    async fn test_last_listener_evicted_drops_key_keeps_value() {
        let f = fixture(Duration::from_secs(1));
        f.registry.subscribe("AMZN", handle_for(SwitchListener::broken()));

        f.broadcaster.run_tick().await;

        assert!(f.registry.keys_with_listeners().is_empty());
        assert_eq!(f.store.get("AMZN"), Some(dec!(100.00)));
    }

    #[tokio::test]
    async fn test_slow_listener_times_out_without_blocking_others() {
        let f = fixture(Duration::from_millis(50));
        let stalled = handle_for(Arc::new(StalledListener {
            delay: Duration::from_secs(10),
        }));
        let recorder = RecordingListener::<Decimal>::new();
        f.registry.subscribe("MSFT", stalled.clone());
        f.registry.subscribe("MSFT", handle_for(recorder.clone()));

        let started = std::time::Instant::now();
        let report = f.broadcaster.run_tick().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 1);
        assert!(!f.registry.is_subscribed("MSFT", stalled.id()));
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn test_keys_without_listeners_are_not_pushed() {
        let f = fixture(Duration::from_secs(1));
        f.store.set("IBM", dec!(120.00));
        let recorder = RecordingListener::<Decimal>::new();
        f.registry.subscribe("AAPL", handle_for(recorder.clone()));

        let report = f.broadcaster.run_tick().await;

        assert_eq!(report.keys, 1);
        assert_eq!(recorder.received(), vec![("AAPL".to_string(), dec!(100.00))]);
        assert_eq!(f.broadcaster.delivery_count("IBM"), 0);
        assert_eq!(f.broadcaster.total_deliveries(), 1);
    }

    // Fails its push, but unsubscribes and re-subscribes itself while the push is in flight
    struct Resubscriber {
        registry: Arc<ListenerRegistry<Decimal>>,
        handle: Mutex<Option<ListenerHandle<Decimal>>>,
    }

    #[async_trait]
    impl Listener<Decimal> for Resubscriber {
        async fn notify(&self, key: &str, _: &Decimal) -> Result<(), DeliveryError> {
            let handle = self.handle.lock().unwrap().clone();
            if let Some(handle) = handle {
                self.registry.unsubscribe(key, handle.id());
                self.registry.subscribe(key, handle);
            }
            Err(DeliveryError::Disconnected)
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_evict_renewed_registration() {
        let f = fixture(Duration::from_secs(1));
        let listener = Arc::new(Resubscriber {
            registry: f.registry.clone(),
            handle: Mutex::new(None),
        });
        let handle = handle_for(listener.clone());
        *listener.handle.lock().unwrap() = Some(handle.clone());
        f.registry.subscribe("NFLX", handle.clone());

        let report = f.broadcaster.run_tick().await;

        assert_eq!(report.evicted, 0);
        assert!(f.registry.is_subscribed("NFLX", handle.id()));

        // Break the cycle so the listener is dropped with the fixture
        listener.handle.lock().unwrap().take();
    }
}
