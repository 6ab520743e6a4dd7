//! [`MqttBus`] – [`MessageBus`] over an MQTT broker using `rumqttc`.
//!
//! `rumqttc` connects lazily from inside its event loop and does not restore
//! subscriptions after a reconnect.  [`MqttBus::connect`] therefore polls the
//! event loop until the first `ConnAck` (retrying with a fixed delay) and then
//! hands the loop to a background task that re-issues every active
//! subscription on each later `ConnAck`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vlxbridge_types::BridgeError;

use crate::bus::{BusMessage, DEFAULT_CAPACITY, MessageBus};

/// Connection parameters for [`MqttBus`].
#[derive(Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub login: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Pause between failed connection attempts.
    pub reconnect_delay: Duration,
    /// Give up after this many failed attempts; `None` retries forever.
    pub max_connect_attempts: Option<u32>,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("vlxmqttha_{}", std::process::id()),
            login: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(10),
            max_connect_attempts: None,
        }
    }

    /// `rumqttc` options for these settings.
    pub fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        if let Some(login) = &self.login {
            options.set_credentials(login, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

impl std::fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_connect_attempts", &self.max_connect_attempts)
            .finish()
    }
}

/// MQTT-backed message bus.
pub struct MqttBus {
    client: AsyncClient,
    sender: broadcast::Sender<BusMessage>,
    subscribed_topics: Arc<RwLock<HashSet<String>>>,
    closed: AtomicBool,
    poll_task: JoinHandle<()>,
}

impl MqttBus {
    /// Connect to the broker, retrying with `settings.reconnect_delay` until
    /// the broker acknowledges the connection.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Bus`] once `settings.max_connect_attempts` is exhausted.
    pub async fn connect(settings: &MqttSettings) -> Result<Self, BridgeError> {
        let (client, mut eventloop) = AsyncClient::new(settings.options(), 64);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match wait_for_connack(&mut eventloop).await {
                Ok(()) => break,
                Err(e) => {
                    if settings.max_connect_attempts.is_some_and(|max| attempt >= max) {
                        return Err(BridgeError::Bus(format!(
                            "unable to connect to {}:{} after {attempt} attempts: {e}",
                            settings.host, settings.port
                        )));
                    }
                    error!(
                        host = %settings.host,
                        port = settings.port,
                        attempt,
                        error = %e,
                        "MQTT connection failed, retrying in {}s",
                        settings.reconnect_delay.as_secs()
                    );
                    tokio::time::sleep(settings.reconnect_delay).await;
                }
            }
        }
        info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "MQTT connected");

        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        let subscribed_topics = Arc::new(RwLock::new(HashSet::new()));
        let poll_task = tokio::spawn(poll_loop(
            eventloop,
            client.clone(),
            sender.clone(),
            subscribed_topics.clone(),
            settings.reconnect_delay,
        ));

        Ok(Self {
            client,
            sender,
            subscribed_topics,
            closed: AtomicBool::new(false),
            poll_task,
        })
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BridgeError::Bus("MQTT connection is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

async fn poll_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    sender: broadcast::Sender<BusMessage>,
    subscribed_topics: Arc<RwLock<HashSet<String>>>,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let topics: Vec<String> = subscribed_topics.read().await.iter().cloned().collect();
                info!(topics = topics.len(), "MQTT reconnected, restoring subscriptions");
                for topic in topics {
                    if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                        error!(topic = %topic, error = %e, "failed to resubscribe");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                if subscribed_topics.read().await.contains(&msg.topic) {
                    debug!(topic = %msg.topic, bytes = msg.payload.len(), "MQTT message received");
                    let _ = sender.send(BusMessage::new(msg.topic, msg.payload.to_vec()));
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection lost, reconnecting in {}s", reconnect_delay.as_secs());
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await
            .map_err(|e| BridgeError::Bus(format!("publish to {topic} failed: {e}")))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::Bus(format!("subscribe to {topic} failed: {e}")))?;
        self.subscribed_topics.write().await.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BridgeError> {
        if !self.subscribed_topics.write().await.remove(topic) {
            return Ok(());
        }
        self.ensure_open()?;
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| BridgeError::Bus(format!("unsubscribe from {topic} failed: {e}")))
    }

    fn incoming(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.subscribed_topics.write().await.clear();
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| BridgeError::Bus(format!("disconnect failed: {e}")));
        // The loop may be stuck in a reconnect sleep and never see the
        // outgoing disconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.poll_task.abort();
        info!("MQTT disconnected");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_carry_keep_alive_and_credentials() {
        let mut settings = MqttSettings::new("broker.local", 1884);
        settings.client_id = "vlxmqttha_test".into();
        settings.login = Some("ha".into());
        settings.password = Some("secret".into());
        settings.keep_alive = Duration::from_secs(30);

        let options = settings.options();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "vlxmqttha_test");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some(("ha".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn anonymous_without_login() {
        let settings = MqttSettings::new("localhost", 1883);
        assert_eq!(settings.options().credentials(), None);
        assert!(settings.client_id.starts_with("vlxmqttha_"));
    }

    #[test]
    fn debug_redacts_password() {
        let mut settings = MqttSettings::new("localhost", 1883);
        settings.password = Some("hunter2".into());
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        // Port 1 on localhost refuses immediately.
        let mut settings = MqttSettings::new("127.0.0.1", 1);
        settings.reconnect_delay = Duration::from_millis(10);
        settings.max_connect_attempts = Some(2);
        let result = MqttBus::connect(&settings).await;
        assert!(matches!(result, Err(BridgeError::Bus(_))));
    }
}
