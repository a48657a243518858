use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::data::{DeliveryError, Listener};
use crate::websocket::protocol::{Notification, Topic};

/// A frame queued for a connection's writer. Pushes carry an ack that resolves
/// once the frame has been written to the socket.
#[derive(Debug)]
pub struct Outbound {
    pub frame: String,
    pub ack: Option<oneshot::Sender<Result<(), DeliveryError>>>,
}

impl Outbound {
    pub fn reply(frame: String) -> Self {
        Self { frame, ack: None }
    }
}

// Delivers notifications for one topic over one WebSocket connection
pub struct WsListener {
    topic: Topic,
    outbound: mpsc::Sender<Outbound>,
}

impl WsListener {
    pub fn new(topic: Topic, outbound: mpsc::Sender<Outbound>) -> Self {
        Self { topic, outbound }
    }
}

#[async_trait]
impl<V> Listener<V> for WsListener
where
    V: Serialize + Send + Sync,
{
    async fn notify(&self, key: &str, value: &V) -> Result<(), DeliveryError> {
        let notification = Notification {
            topic: self.topic,
            key,
            value,
            timestamp: Utc::now().to_rfc3339(),
        };
        let frame = serde_json::to_string(&notification)
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                frame,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| DeliveryError::Disconnected)?;

        // Writer gone before answering means the connection is gone
        ack_rx.await.map_err(|_| DeliveryError::Disconnected)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_notify_waits_for_writer_ack() {
        let (tx, mut rx) = mpsc::channel(4);
        let listener = WsListener::new(Topic::Prices, tx);

        let writer = tokio::spawn(async move {
            let outbound = rx.recv().await.unwrap();
            let ack = outbound.ack.unwrap();
            ack.send(Ok(())).unwrap();
            outbound.frame
        });

        let result = Listener::<Decimal>::notify(&listener, "AAPL", &dec!(151.23)).await;
        assert!(result.is_ok());

        let frame: serde_json::Value = serde_json::from_str(&writer.await.unwrap()).unwrap();
        assert_eq!(frame["key"], "AAPL");
        assert_eq!(frame["value"], "151.23");
        assert_eq!(frame["topic"], "prices");
    }

    #[tokio::test]
    async fn test_notify_fails_when_connection_closed() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let listener = WsListener::new(Topic::Changes, tx);

        let result = Listener::<String>::notify(&listener, "config", &"Changed".to_string()).await;
        assert_eq!(result, Err(DeliveryError::Disconnected));
    }

    #[tokio::test]
    async fn test_notify_surfaces_write_error() {
        let (tx, mut rx) = mpsc::channel(4);
        let listener = WsListener::new(Topic::Prices, tx);

        tokio::spawn(async move {
            let outbound: Outbound = rx.recv().await.unwrap();
            let _ = outbound
                .ack
                .unwrap()
                .send(Err(DeliveryError::Transport("broken pipe".to_string())));
        });

        let result = Listener::<Decimal>::notify(&listener, "AAPL", &dec!(1)).await;
        assert_eq!(result, Err(DeliveryError::Transport("broken pipe".to_string())));
    }
}
