use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use log::{debug, error, info, warn};

use crate::config::OUTBOUND_CHANNEL_SIZE;
use crate::data::controller::SubscribeReceipt;
use crate::data::{DeliveryError, Listener, ListenerHandle, Notifier};
use crate::websocket::listener::{Outbound, WsListener};
use crate::websocket::protocol::{SubscriptionMessage, SubscriptionResponse, Topic};

/// Per-connection subscription state. The connection is one listener handle
/// per topic; the key sets remember what to release on disconnect.
pub struct Session {
    outbound: mpsc::Sender<Outbound>,
    price_handle: ListenerHandle<Decimal>,
    change_handle: ListenerHandle<String>,
    price_keys: BTreeSet<String>,
    change_keys: BTreeSet<String>,
}

impl Session {
    pub fn new(outbound: mpsc::Sender<Outbound>) -> Self {
        let prices: Arc<dyn Listener<Decimal>> = Arc::new(WsListener::new(Topic::Prices, outbound.clone()));
        let changes: Arc<dyn Listener<String>> = Arc::new(WsListener::new(Topic::Changes, outbound.clone()));

        Self {
            outbound,
            price_handle: ListenerHandle::new(prices),
            change_handle: ListenerHandle::new(changes),
            price_keys: BTreeSet::new(),
            change_keys: BTreeSet::new(),
        }
    }

    pub fn keys(&self, topic: Topic) -> &BTreeSet<String> {
        match topic {
            Topic::Prices => &self.price_keys,
            Topic::Changes => &self.change_keys,
        }
    }

    fn keys_mut(&mut self, topic: Topic) -> &mut BTreeSet<String> {
        match topic {
            Topic::Prices => &mut self.price_keys,
            Topic::Changes => &mut self.change_keys,
        }
    }

    async fn reply(&self, response: &SubscriptionResponse) {
        match serde_json::to_string(response) {
            Ok(frame) => {
                let _ = self.outbound.send(Outbound::reply(frame)).await;
            }
            Err(e) => error!("Failed to encode subscription response: {}", e),
        }
    }
}

pub struct WebSocketHandler {
    prices: Arc<Notifier<Decimal>>,
    changes: Arc<Notifier<String>>,
    peer_addr: String,
}

impl WebSocketHandler {
    pub fn new(prices: Arc<Notifier<Decimal>>, changes: Arc<Notifier<String>>, peer_addr: String) -> Self {
        Self {
            prices,
            changes,
            peer_addr,
        }
    }

    pub async fn handle_connection(self, stream: TcpStream) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {:?}", self.peer_addr, e);
                return;
            }
        };

        info!("WebSocket connection established from {}", self.peer_addr);
        self.handle_websocket_connection(ws_stream).await;
    }

    async fn handle_websocket_connection(&self, ws_stream: WebSocketStream<TcpStream>) {
        let (write, mut read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_CHANNEL_SIZE);
        let (close_tx, close_rx) = mpsc::channel::<()>(1);

        let mut session = Session::new(outbound_tx);
        let mut write_task = Self::spawn_write_task(write, outbound_rx, close_rx);

        let read_loop = async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SubscriptionMessage>(&text) {
                        Ok(command) => {
                            let response = self.handle_command(&mut session, command).await;
                            session.reply(&response).await;
                        }
                        Err(_) => {
                            debug!("Ignoring non-subscription text from {}: {}", self.peer_addr, text);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        info!("Client {} sent close frame", self.peer_addr);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("WebSocket error for {}: {:?}", self.peer_addr, e);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = read_loop => {
                let _ = close_tx.send(()).await;
            }
            _ = &mut write_task => {
                info!("Write task completed for {}", self.peer_addr);
            }
        }

        self.release(&mut session);
        write_task.abort();

        info!("WebSocket connection closed from {}", self.peer_addr);
    }

    // Acks each push once its frame is written; pending acks fail when the task ends
    fn spawn_write_task(
        mut write: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        mut close_rx: mpsc::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(outbound) = outbound_rx.recv() => {
                        let result = write
                            .send(Message::Text(outbound.frame))
                            .await
                            .map_err(|e| DeliveryError::Transport(e.to_string()));
                        let failed = result.is_err();

                        if let Some(ack) = outbound.ack {
                            let _ = ack.send(result);
                        }
                        if failed {
                            warn!("Error sending frame, closing writer");
                            break;
                        }
                    }
                    _ = close_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Applies one client command to the session and returns the reply.
    pub async fn handle_command(&self, session: &mut Session, command: SubscriptionMessage) -> SubscriptionResponse {
        let topic = command.topic;

        match command.action.as_str() {
            "subscribe" | "unsubscribe" => {
                let key = match command.key.map(|k| k.trim().to_string()) {
                    Some(key) if !key.is_empty() => key,
                    _ => return SubscriptionResponse::error(topic, None, "Missing key"),
                };

                if command.action == "subscribe" {
                    self.subscribe(session, topic, key).await
                } else {
                    self.unsubscribe(session, topic, key)
                }
            }
            "unsubscribe_all" => {
                let released = self.release_topic(session, topic);
                SubscriptionResponse::success(
                    topic,
                    None,
                    format!("Successfully unsubscribed from {} keys", released),
                )
            }
            other => {
                warn!("Unknown subscription action from {}: {}", self.peer_addr, other);
                SubscriptionResponse::error(topic, command.key, format!("Unknown action: {}", other))
            }
        }
    }

    async fn subscribe(&self, session: &mut Session, topic: Topic, key: String) -> SubscriptionResponse {
        if self.is_registered(session, topic, &key) {
            return SubscriptionResponse::error(topic, Some(key), "Already subscribed to this key");
        }

        let (delivered, existed_before) = match topic {
            Topic::Prices => self.receipt(&key, self.prices.subscribe(&key, session.price_handle.clone()).await),
            Topic::Changes => self.receipt(&key, self.changes.subscribe(&key, session.change_handle.clone()).await),
        };
        session.keys_mut(topic).insert(key.clone());

        let message = if !delivered {
            "Subscribed; initial value not delivered"
        } else if existed_before {
            "Successfully subscribed"
        } else {
            "Successfully subscribed to new key"
        };
        SubscriptionResponse::success(topic, Some(key), message)
    }

    // The session's key set goes stale when the broadcaster evicts this connection
    // or another connection takes a single-listener key
    fn is_registered(&self, session: &Session, topic: Topic, key: &str) -> bool {
        session.keys(topic).contains(key)
            && match topic {
                Topic::Prices => self.prices.registry().is_subscribed(key, session.price_handle.id()),
                Topic::Changes => self.changes.registry().is_subscribed(key, session.change_handle.id()),
            }
    }

    fn receipt<V: Display>(&self, key: &str, receipt: SubscribeReceipt<V>) -> (bool, bool) {
        debug!("{} subscribed to {} at {}", self.peer_addr, key, receipt.value);
        (receipt.delivered, receipt.existed_before)
    }

    fn unsubscribe(&self, session: &mut Session, topic: Topic, key: String) -> SubscriptionResponse {
        if !session.keys_mut(topic).remove(&key) {
            return SubscriptionResponse::error(topic, Some(key), "Not subscribed to this key");
        }

        match topic {
            Topic::Prices => self.prices.unsubscribe(&key, session.price_handle.id()),
            Topic::Changes => self.changes.unsubscribe(&key, session.change_handle.id()),
        }
        SubscriptionResponse::success(topic, Some(key), "Successfully unsubscribed")
    }

    fn release_topic(&self, session: &mut Session, topic: Topic) -> usize {
        let keys = std::mem::take(session.keys_mut(topic));
        for key in &keys {
            match topic {
                Topic::Prices => self.prices.unsubscribe(key, session.price_handle.id()),
                Topic::Changes => self.changes.unsubscribe(key, session.change_handle.id()),
            }
        }
        keys.len()
    }

    /// Drops every registration the session still holds.
    pub fn release(&self, session: &mut Session) {
        let released = self.release_topic(session, Topic::Prices) + self.release_topic(session, Topic::Changes);
        if released > 0 {
            info!("Released {} subscriptions for {}", released, self.peer_addr);
        }
    }
}
