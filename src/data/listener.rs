use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::info;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber disconnected")]
    Disconnected,
    #[error("push timed out after {0:?}")]
    TimedOut(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    // First 8 hex chars, enough to tell listeners apart in logs
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote callback capability. Implemented by whatever transport carries the
/// notification to the subscriber; completes once the subscriber has it or fails.
#[async_trait]
pub trait Listener<V>: Send + Sync {
    async fn notify(&self, key: &str, value: &V) -> Result<(), DeliveryError>;
}

/// Opaque handle stored in the registry: an identity plus the callback bound to
/// its transport. Two handles are the same registration iff their ids match.
pub struct ListenerHandle<V> {
    id: ListenerId,
    listener: Arc<dyn Listener<V>>,
}

impl<V> ListenerHandle<V> {
    pub fn new(listener: Arc<dyn Listener<V>>) -> Self {
        Self::with_id(ListenerId::new(), listener)
    }

    pub fn with_id(id: ListenerId, listener: Arc<dyn Listener<V>>) -> Self {
        Self { id, listener }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl<V: Send + Sync> ListenerHandle<V> {
    /// Pushes `value` for `key`, treating an overrun of `timeout` as a failed delivery.
    pub async fn push(&self, key: &str, value: &V, timeout: Duration) -> Result<(), DeliveryError> {
        match tokio::time::timeout(timeout, self.listener.notify(key, value)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::TimedOut(timeout)),
        }
    }
}

impl<V> Clone for ListenerHandle<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: self.listener.clone(),
        }
    }
}

impl<V> fmt::Debug for ListenerHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

impl<V> PartialEq for ListenerHandle<V> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<V> Eq for ListenerHandle<V> {}

// In-process subscriber that just logs what it receives
pub struct LogListener {
    client_id: String,
}

impl LogListener {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl<V> Listener<V> for LogListener
where
    V: fmt::Display + Send + Sync,
{
    async fn notify(&self, key: &str, value: &V) -> Result<(), DeliveryError> {
        info!("[client {}] {} changed: {}", self.client_id, key, value);
        Ok(())
    }
}
