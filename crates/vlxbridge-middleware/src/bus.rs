//! Topic-based publish/subscribe seam between the bridge and the outside
//! world.
//!
//! The bridge never speaks MQTT directly.  It publishes through the
//! [`MessageBus`] trait and receives commands from
//! [`MessageBus::incoming`], a [`tokio::sync::broadcast`] channel carrying
//! every message on a subscribed topic.  Every receiver gets every message,
//! so one slow consumer never blocks the others.
//!
//! | Implementation | Use |
//! |---|---|
//! | [`MqttBus`][crate::mqtt::MqttBus] | A real broker via `rumqttc`. |
//! | [`LocalBus`] | In-process bus that records traffic; used by tests and dry runs. |

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;
use vlxbridge_types::BridgeError;

/// Default channel capacity (number of buffered inbound messages before old
/// ones are dropped for slow receivers).
pub const DEFAULT_CAPACITY: usize = 256;

/// One message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Every bus transport must implement this trait.
///
/// # Contract
///
/// * `publish` is fire-and-forget from the caller's point of view: it
///   returns once the transport accepted the message, not when a consumer
///   saw it.
/// * `subscribe` makes messages on `topic` appear on every receiver obtained
///   from `incoming`.  Subscribing twice is harmless.
/// * `unsubscribe` of an unknown topic is a no-op.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BridgeError>;

    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BridgeError>;

    /// A fresh receiver for inbound messages on subscribed topics.
    fn incoming(&self) -> broadcast::Receiver<BusMessage>;

    /// Close the transport.  Publishing afterwards fails with
    /// [`BridgeError::Bus`].
    async fn disconnect(&self) -> Result<(), BridgeError>;
}

/// A published message as recorded by [`LocalBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    /// Payload as UTF-8 text (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Default)]
struct LocalState {
    subscriptions: HashSet<String>,
    retained: HashMap<String, Vec<u8>>,
    log: Vec<Published>,
    closed: bool,
}

/// In-process [`MessageBus`].
///
/// Behaves like a broker with a single client: retained messages are kept
/// per topic (an empty retained payload clears the topic), and messages
/// published to a subscribed topic loop back to `incoming`.  Every publish
/// is appended to a log that tests can inspect.
#[derive(Debug)]
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
    state: Mutex<LocalState>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Deliver a message as if another client had published it.
    ///
    /// Returns `false` when nothing is subscribed to `topic` and the message
    /// was discarded.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        if !self.state().subscriptions.contains(topic) {
            debug!(topic, "no subscription, message discarded");
            return false;
        }
        // No live receiver is not an error for a broker.
        let _ = self.sender.send(BusMessage::new(topic, payload));
        true
    }

    /// Current retained payload of `topic`, as text.
    pub fn retained(&self, topic: &str) -> Option<String> {
        self.state()
            .retained
            .get(topic)
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state().subscriptions.contains(topic)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.state().subscriptions.iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<Published> {
        self.state().log.clone()
    }

    /// Messages published to `topic`, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.state()
            .log
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        // A panicking test thread must not take the bus down with it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BridgeError> {
        let loopback = {
            let mut state = self.state();
            if state.closed {
                return Err(BridgeError::Bus(format!("publish to {topic} after disconnect")));
            }
            if retain {
                if payload.is_empty() {
                    state.retained.remove(topic);
                } else {
                    state.retained.insert(topic.to_string(), payload.to_vec());
                }
            }
            state.log.push(Published {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retain,
            });
            state.subscriptions.contains(topic)
        };
        if loopback {
            let _ = self.sender.send(BusMessage::new(topic, payload));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError> {
        let mut state = self.state();
        if state.closed {
            return Err(BridgeError::Bus(format!("subscribe to {topic} after disconnect")));
        }
        state.subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.state().subscriptions.remove(topic);
        Ok(())
    }

    fn incoming(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        let mut state = self.state();
        state.closed = true;
        state.subscriptions.clear();
        Ok(())
    }
}
