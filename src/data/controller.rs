use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use log::{debug, error, info, warn};

use crate::data::broadcaster::Broadcaster;
use crate::data::listener::{ListenerHandle, ListenerId};
use crate::data::pubsub::{Cardinality, DefaultValue, ListenerRegistry};
use crate::data::store::ValueStore;
use crate::data::updater::{Updater, ValueSource};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifierState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("notifier {0} is already running")]
    AlreadyRunning(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub update_interval: Duration,
    pub broadcast_interval: Duration,
    // Delay before the first broadcast tick
    pub broadcast_delay: Duration,
    pub push_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeReceipt<V> {
    pub value: V,
    pub existed_before: bool,
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicStats {
    pub topic: String,
    pub state: NotifierState,
    pub cardinality: Cardinality,
    pub keys: usize,
    pub keys_with_listeners: usize,
    pub registrations: usize,
    pub deliveries: u64,
    pub evictions: u64,
}

/// One keyed notification topic: value store, listener registry, updater and
/// broadcaster wired together. Nothing runs until [`Notifier::start`].
pub struct Notifier<V> {
    topic: String,
    store: Arc<ValueStore<V>>,
    registry: Arc<ListenerRegistry<V>>,
    updater: Arc<Updater<V>>,
    broadcaster: Arc<Broadcaster<V>>,
    schedule: Schedule,
    state: Arc<Mutex<NotifierState>>,
}

impl<V> Notifier<V>
where
    V: Clone + Display + Send + Sync + 'static,
{
    pub fn new(
        topic: impl Into<String>,
        store: Arc<ValueStore<V>>,
        cardinality: Cardinality,
        default_value: DefaultValue<V>,
        source: Arc<dyn ValueSource<V>>,
        schedule: Schedule,
        seed: Option<u64>,
    ) -> Self {
        let registry = Arc::new(ListenerRegistry::new(store.clone(), cardinality, default_value));
        let updater = Arc::new(Updater::new(store.clone(), source, seed));
        let broadcaster = Arc::new(Broadcaster::new(store.clone(), registry.clone(), schedule.push_timeout));

        Self {
            topic: topic.into(),
            store,
            registry,
            updater,
            broadcaster,
            schedule,
            state: Arc::new(Mutex::new(NotifierState::Stopped)),
        }
    }

    pub fn get_state(&self) -> NotifierState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `handle` for `key` and immediately pushes the current value to it.
    ///
    /// A failed initial push is only logged: the handle stays registered and is
    /// left to the broadcaster's eviction path.
    pub async fn subscribe(&self, key: &str, handle: ListenerHandle<V>) -> SubscribeReceipt<V> {
        let id = handle.id();
        let subscription = self.registry.subscribe(key, handle.clone());
        info!("Listener {} subscribed to {}/{}", id.short(), self.topic, key);

        let delivered = match handle.push(key, &subscription.value, self.schedule.push_timeout).await {
            Ok(()) => {
                debug!("Sent initial {} value to {}: {}", key, id.short(), subscription.value);
                true
            }
            Err(e) => {
                warn!("Failed to send initial {} value to {}: {}", key, id.short(), e);
                false
            }
        };

        SubscribeReceipt {
            value: subscription.value,
            existed_before: subscription.existed_before,
            delivered,
        }
    }

    // Idempotent; unknown keys and listeners are ignored
    pub fn unsubscribe(&self, key: &str, id: ListenerId) {
        if self.registry.unsubscribe(key, id) {
            info!("Listener {} unsubscribed from {}/{}", id.short(), self.topic, key);
        }
    }

    /// Spawns the updater and broadcaster loops. They run until the returned
    /// tasks are stopped or dropped.
    pub fn start(&self) -> Result<NotifierTasks, ControlError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == NotifierState::Running {
                return Err(ControlError::AlreadyRunning(self.topic.clone()));
            }
            *state = NotifierState::Running;
        }

        let cancel = CancellationToken::new();
        let handles = vec![
            self.spawn_updater(cancel.clone()),
            self.spawn_broadcaster(cancel.clone()),
        ];

        info!(
            "Started {} notifier (update every {:?}, broadcast every {:?})",
            self.topic, self.schedule.update_interval, self.schedule.broadcast_interval
        );

        Ok(NotifierTasks {
            topic: self.topic.clone(),
            cancel,
            handles,
            state: self.state.clone(),
        })
    }

    fn spawn_updater(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let updater = self.updater.clone();
        let period = self.schedule.update_interval;
        let topic = self.topic.clone();

        tokio::spawn(async move {
            let mut interval_timer = interval_at(Instant::now(), period);
            interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let ticks = async {
                loop {
                    interval_timer.tick().await;
                    let report = updater.run_tick();
                    if report.changed > 0 || report.failed > 0 {
                        debug!("{} updater: {} changed, {} failed", topic, report.changed, report.failed);
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = ticks => {}
            }
            info!("Stopped {} updater", topic);
        })
    }

    fn spawn_broadcaster(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let broadcaster = self.broadcaster.clone();
        let period = self.schedule.broadcast_interval;
        let delay = self.schedule.broadcast_delay;
        let topic = self.topic.clone();

        tokio::spawn(async move {
            let mut interval_timer = interval_at(Instant::now() + delay, period);
            interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // In-flight pushes are dropped on cancellation
            let ticks = async {
                loop {
                    interval_timer.tick().await;
                    let report = broadcaster.run_tick().await;
                    if report.keys > 0 {
                        debug!(
                            "{} broadcast: {} keys, {} delivered, {} evicted",
                            topic, report.keys, report.delivered, report.evicted
                        );
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = ticks => {}
            }
            info!("Stopped {} broadcaster", topic);
        })
    }

    pub fn get_value(&self, key: &str) -> Option<V> {
        self.store.get(key)
    }

    pub fn values(&self) -> BTreeMap<String, V> {
        self.store.snapshot()
    }

    pub fn registry(&self) -> &ListenerRegistry<V> {
        &self.registry
    }

    #[cfg(test)]
    pub fn updater(&self) -> &Updater<V> {
        &self.updater
    }

    #[cfg(test)]
    pub fn broadcaster(&self) -> &Broadcaster<V> {
        &self.broadcaster
    }

    pub fn get_stats(&self) -> TopicStats {
        let (keys_with_listeners, registrations) = self.registry.get_stats();
        TopicStats {
            topic: self.topic.clone(),
            state: self.get_state(),
            cardinality: self.registry.cardinality(),
            keys: self.store.len(),
            keys_with_listeners,
            registrations,
            deliveries: self.broadcaster.total_deliveries(),
            evictions: self.broadcaster.eviction_count(),
        }
    }
}

/// Running updater and broadcaster of one notifier. Dropping it cancels both.
#[must_use = "the notifier stops as soon as its tasks are dropped"]
pub struct NotifierTasks {
    topic: String,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    state: Arc<Mutex<NotifierState>>,
}

impl NotifierTasks {
    /// Signals cancellation and waits up to `grace` per task, aborting stragglers.
    pub async fn stop(mut self, grace: Duration) {
        self.cancel.cancel();

        for mut handle in std::mem::take(&mut self.handles) {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} task ended abnormally: {}", self.topic, e),
                Err(_) => {
                    warn!("{} task did not stop within {:?}, aborting", self.topic, grace);
                    handle.abort();
                }
            }
        }

        info!("{} notifier stopped", self.topic);
    }
}

impl Drop for NotifierTasks {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            warn!("{} tasks dropped without stop, cancelling", self.topic);
            self.cancel.cancel();
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = NotifierState::Stopped;
    }
}
