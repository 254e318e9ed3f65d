//! MQTT transport client
//!
//! MQTT is push-based, so a background task drains the rumqttc event loop
//! into a per-topic cache. A read returns a cached message younger than the
//! freshness window, or subscribes and waits for the next one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::client::{ReadRequest, TransportClient, WriteRequest};
use crate::core::entity::{Address, DEFAULT_MQTT_WAIT};
use crate::core::registry::Protocol;
use crate::core::types::{BrokerMessage, RawValue};

pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Cached messages younger than this satisfy a read without waiting
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(60);

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Broker connection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
}

struct Session {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
}

pub struct MqttClient {
    settings: MqttSettings,
    client_id: String,
    timeout: Duration,
    session: Option<Session>,
    cache: Arc<DashMap<String, BrokerMessage>>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    messages: broadcast::Sender<BrokerMessage>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("broker", &self.settings.broker)
            .field("port", &self.settings.port)
            .field("client_id", &self.client_id)
            .field("cached_topics", &self.cache.len())
            .finish()
    }
}

impl MqttClient {
    pub fn new(settings: MqttSettings, timeout: Duration) -> Self {
        let client_id = settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("fieldpoll_{}", rand::random::<u16>() % 9000 + 1000));
        let (messages, _) = broadcast::channel(256);
        Self {
            settings,
            client_id,
            timeout,
            session: None,
            cache: Arc::new(DashMap::new()),
            subscriptions: Arc::new(Mutex::new(HashSet::new())),
            messages,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Most recent cached message matching `filter`
    fn cached(&self, filter: &str) -> Option<BrokerMessage> {
        if !has_wildcard(filter) {
            return self.cache.get(filter).map(|m| m.value().clone());
        }
        self.cache
            .iter()
            .filter(|entry| topic_matches(filter, entry.key()))
            .max_by_key(|entry| entry.value().received_at)
            .map(|entry| entry.value().clone())
    }

    async fn subscribe(&self, topic: &str) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        if self.subscriptions.lock().contains(topic) {
            return true;
        }
        match session.client.subscribe(topic, QoS::AtLeastOnce).await {
            Ok(()) => {
                debug!("MQTT subscribed to {}", topic);
                self.subscriptions.lock().insert(topic.to_string());
                true
            },
            Err(e) => {
                warn!("MQTT subscribe {} failed: {}", topic, e);
                false
            },
        }
    }

    fn spawn_event_loop(
        &self,
        mut eventloop: rumqttc::EventLoop,
        client: AsyncClient,
        connected: watch::Sender<bool>,
        cancel: CancellationToken,
    ) {
        let cache = Arc::clone(&self.cache);
        let subscriptions = Arc::clone(&self.subscriptions);
        let messages = self.messages.clone();
        let broker = format!("{}:{}", self.settings.broker, self.settings.port);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        let was_connected = connected.send_replace(true);
                        if !was_connected {
                            // Clean sessions drop subscriptions on reconnect
                            let topics: Vec<String> = subscriptions.lock().iter().cloned().collect();
                            for topic in topics {
                                if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                    warn!("MQTT resubscribe {} failed: {}", topic, e);
                                }
                            }
                        }
                    },
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        trace!("MQTT message on {} ({} bytes)", p.topic, p.payload.len());
                        let message = BrokerMessage {
                            topic: p.topic.clone(),
                            payload: p.payload.to_vec(),
                            qos: qos_level(p.qos),
                            retained: p.retain,
                            received_at: Instant::now(),
                        };
                        cache.insert(p.topic, message.clone());
                        // No receivers is fine: nobody is waiting
                        let _ = messages.send(message);
                    },
                    Ok(_) => {},
                    Err(e) => {
                        if connected.send_replace(false) {
                            warn!("MQTT connection to {} lost: {}", broker, e);
                        } else {
                            debug!("MQTT connection to {} failed: {}", broker, e);
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RETRY_DELAY) => {},
                        }
                    },
                }
            }
            connected.send_replace(false);
            debug!("MQTT event loop for {} stopped", broker);
        });
    }
}

#[async_trait]
impl TransportClient for MqttClient {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.settings.broker, self.settings.port)
    }

    async fn connect(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }
        // A session whose event loop is still retrying is replaced
        if let Some(old) = self.session.take() {
            old.cancel.cancel();
        }
        self.subscriptions.lock().clear();

        let mut options =
            MqttOptions::new(self.client_id.clone(), self.settings.broker.clone(), self.settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(user), Some(pass)) = (&self.settings.username, &self.settings.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        let (connected_tx, mut connected_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        self.spawn_event_loop(eventloop, client.clone(), connected_tx, cancel.clone());

        let ready = matches!(
            tokio::time::timeout(self.timeout, connected_rx.wait_for(|c| *c)).await,
            Ok(Ok(_))
        );
        if !ready {
            warn!("MQTT connect to {} timed out", self.endpoint());
            cancel.cancel();
            return false;
        }

        info!("MQTT connected: {} as {}", self.endpoint(), self.client_id);
        self.session = Some(Session {
            client,
            connected: connected_rx,
            cancel,
        });
        true
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.client.disconnect().await {
                debug!("MQTT disconnect: {}", e);
            }
            session.cancel.cancel();
            info!("MQTT disconnected: {}", self.endpoint());
        }
        self.subscriptions.lock().clear();
        self.cache.clear();
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| *s.connected.borrow())
            .unwrap_or(false)
    }

    async fn read(&mut self, address: &Address, request: &ReadRequest) -> Option<RawValue> {
        let Address::Topic(topic) = address else {
            warn!("MQTT read with non-topic address {}", address);
            return None;
        };
        if !self.is_connected() {
            debug!("MQTT read {} while disconnected", topic);
            return None;
        }

        let cached = self.cached(topic);
        if let Some(msg) = cached.as_ref().filter(|m| is_fresh(m, Instant::now())) {
            return Some(RawValue::Message(msg.clone()));
        }

        // Listen before subscribing so a retained message is not missed
        let mut rx = self.messages.subscribe();
        if !self.subscribe(topic).await {
            return cached.map(RawValue::Message);
        }

        let wait = request.wait.unwrap_or(DEFAULT_MQTT_WAIT);
        next_message(&mut rx, topic, wait, cached).await.map(RawValue::Message)
    }

    async fn write(&mut self, address: &Address, value: &RawValue, request: &WriteRequest) -> bool {
        let (Address::Topic(topic), RawValue::Payload(payload)) = (address, value) else {
            warn!("MQTT publish needs a topic and a payload, got {} / {:?}", address, value);
            return false;
        };
        let Some(session) = &self.session else {
            warn!("MQTT publish {} while disconnected", topic);
            return false;
        };
        match session
            .client
            .publish(topic.as_str(), to_qos(request.qos), request.retain, payload.clone())
            .await
        {
            Ok(()) => {
                debug!("MQTT published {} bytes to {}", payload.len(), topic);
                true
            },
            Err(e) => {
                warn!("MQTT publish {} failed: {}", topic, e);
                false
            },
        }
    }

    async fn prime(&mut self, addresses: &[Address]) {
        for address in addresses {
            if let Address::Topic(topic) = address {
                self.subscribe(topic).await;
            }
        }
    }
}

/// Whether a cached message is recent enough to answer a read at `now`
pub fn is_fresh(message: &BrokerMessage, now: Instant) -> bool {
    now.saturating_duration_since(message.received_at) < FRESHNESS_WINDOW
}

/// Next message matching `filter` within `wait`, else `fallback`
pub async fn next_message(
    rx: &mut broadcast::Receiver<BrokerMessage>,
    filter: &str,
    wait: Duration,
    fallback: Option<BrokerMessage>,
) -> Option<BrokerMessage> {
    let next = tokio::time::timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(msg) if topic_matches(filter, &msg.topic) => return Some(msg),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match next {
        Ok(Some(msg)) => Some(msg),
        _ => {
            debug!("MQTT no message on {} within {:?}", filter, wait);
            fallback
        },
    }
}

fn to_qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

fn has_wildcard(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// MQTT topic filter matching with `+` and `#`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match (part, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {},
            (p, Some(l)) if p == l => {},
            _ => return false,
        }
    }
    levels.next().is_none()
}
