// Copyright (c) 2025 - Cowboy AI, Inc.
//! MQTT backend
//!
//! Envelopes travel as JSON bodies. One event-loop task owns the rumqttc
//! [`EventLoop`] and routes every inbound publish to each registered filter
//! that matches its topic:
//!
//! ```text
//! broker ──▶ EventLoop::poll ──▶ topic_matches(filter, topic)
//!                                   ├─▶ route "cim/events/#"  ─▶ messages
//!                                   └─▶ route "cim/events/+/x" ─▶ messages
//! ```
//!
//! Raw bodies can be published and received without an envelope through the
//! binary passthrough operations.

pub mod options;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, Publish};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::MessageClient;
use crate::config::MessageBusConfig;
use crate::envelope::{content_type, ErrorSender, MessageEnvelope, TopicChannel};
use crate::errors::{BusError, BusResult};
use crate::topics::topic_matches;

pub use options::MqttClientOptions;

/// Delay between reconnect attempts when `AutoReconnect` is on
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Where inbound publishes for one filter go
#[derive(Clone)]
struct Route {
    messages: tokio::sync::mpsc::Sender<MessageEnvelope>,
    errors: ErrorSender,
    /// Deliver the raw body instead of decoding an envelope
    binary: bool,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

struct MqttSession {
    client: AsyncClient,
    event_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

enum SessionState {
    Idle,
    Connected(Arc<MqttSession>),
    Closed,
}

/// [`MessageClient`] over an MQTT 3.1.1 broker
pub struct MqttBusClient {
    options: MqttClientOptions,
    session: RwLock<SessionState>,
    routes: Routes,
}

impl MqttBusClient {
    pub fn new(options: MqttClientOptions) -> Self {
        Self {
            options,
            session: RwLock::new(SessionState::Idle),
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &MessageBusConfig) -> BusResult<Self> {
        Ok(Self::new(MqttClientOptions::from_config(config)?))
    }

    pub fn options(&self) -> &MqttClientOptions {
        &self.options
    }

    /// True when `topic` has an active subscription
    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.routes.lock().await.contains_key(topic)
    }

    fn session(&self) -> BusResult<Arc<MqttSession>> {
        let state = self
            .session
            .read()
            .map_err(|_| BusError::operation("session", "session state lock poisoned"))?;
        match &*state {
            SessionState::Connected(session) => Ok(session.clone()),
            _ => Err(BusError::NotConnected),
        }
    }

    async fn publish_bytes(
        &self,
        session: &MqttSession,
        payload: Vec<u8>,
        topic: &str,
    ) -> BusResult<()> {
        session
            .client
            .publish(topic, self.options.qos, self.options.retained, payload)
            .await
            .map_err(|e| BusError::operation("publish", e))?;
        debug!(topic = %topic, "Published MQTT message");
        Ok(())
    }

    /// Register routes, then subscribe
    ///
    /// The route table lock is never held across a client call, since the
    /// event loop needs it to dispatch while the client waits on the loop.
    async fn add_routes(
        &self,
        topics: Vec<TopicChannel>,
        errors: ErrorSender,
        binary: bool,
    ) -> BusResult<()> {
        let session = self.session()?;

        for channel in topics {
            let topic = channel.topic;
            let route = Route {
                messages: channel.messages,
                errors: errors.clone(),
                binary,
            };
            let previous = self.routes.lock().await.insert(topic.clone(), route);

            if let Err(e) = session.client.subscribe(topic.as_str(), self.options.qos).await {
                let mut routes = self.routes.lock().await;
                match previous {
                    Some(previous) => routes.insert(topic.clone(), previous),
                    None => routes.remove(&topic),
                };
                return Err(BusError::operation(
                    "subscribe",
                    format!("topic '{}': {}", topic, e),
                ));
            }
            info!(topic = %topic, binary, "Subscribed to MQTT topic");
        }
        Ok(())
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> BusResult<()> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(BusError::connection(format!(
                        "broker refused connection: {:?}",
                        code
                    ))),
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(BusError::connection(e)),
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    routes: Routes,
    closing: Arc<AtomicBool>,
    auto_reconnect: bool,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => dispatch(&routes, publish).await,
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(_) if closing.load(Ordering::SeqCst) => break,
            Err(e) if auto_reconnect => {
                warn!(error = %e, "MQTT connection lost, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            Err(e) => {
                error!(error = %e, "MQTT connection lost");
                let targets: Vec<ErrorSender> = routes
                    .lock()
                    .await
                    .values()
                    .map(|route| route.errors.clone())
                    .collect();
                for errors in targets {
                    let _ = errors.send(BusError::Transport(e.to_string())).await;
                }
                break;
            }
        }
    }
    debug!("MQTT event loop stopped");
}

async fn dispatch(routes: &Routes, publish: Publish) {
    let targets: Vec<Route> = routes
        .lock()
        .await
        .iter()
        .filter(|(filter, _)| topic_matches(filter, &publish.topic))
        .map(|(_, route)| route.clone())
        .collect();

    if targets.is_empty() {
        debug!(topic = %publish.topic, "No subscription matches inbound message");
        return;
    }

    for route in targets {
        match decode(&publish, route.binary) {
            Ok(envelope) => {
                if route.messages.send(envelope).await.is_err() {
                    debug!(topic = %publish.topic, "Message queue closed, dropping message");
                }
            }
            Err(e) => {
                warn!(topic = %publish.topic, error = %e, "Failed to decode MQTT message");
                let _ = route.errors.send(e).await;
            }
        }
    }
}

fn decode(publish: &Publish, binary: bool) -> BusResult<MessageEnvelope> {
    let mut envelope = if binary {
        MessageEnvelope::new(publish.payload.clone(), content_type::BINARY)
    } else {
        serde_json::from_slice::<MessageEnvelope>(&publish.payload).map_err(|e| {
            BusError::Deserialization(format!(
                "unable to decode envelope from '{}': {}",
                publish.topic, e
            ))
        })?
    };
    envelope.received_topic = publish.topic.clone();
    Ok(envelope)
}

fn lock_poisoned(operation: &'static str) -> BusError {
    BusError::operation(operation, "session state lock poisoned")
}

#[async_trait]
impl MessageClient for MqttBusClient {
    async fn connect(&self) -> BusResult<()> {
        {
            let state = self.session.read().map_err(|_| lock_poisoned("connect"))?;
            if !matches!(*state, SessionState::Idle) {
                return Err(BusError::AlreadyConnected);
            }
        }

        let mqtt_options = self.options.to_mqtt_options().await?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, self.options.capacity_hint);

        tokio::time::timeout(self.options.connect_timeout, wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| {
                BusError::connection(format!(
                    "timed out after {:?} waiting for CONNACK from {}:{}",
                    self.options.connect_timeout, self.options.host, self.options.port
                ))
            })??;

        let closing = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_event_loop(
            event_loop,
            self.routes.clone(),
            closing.clone(),
            self.options.auto_reconnect,
        ));
        let session = Arc::new(MqttSession {
            client,
            event_loop: std::sync::Mutex::new(Some(task)),
            closing,
        });

        let mut state = self.session.write().map_err(|_| lock_poisoned("connect"))?;
        if !matches!(*state, SessionState::Idle) {
            session.closing.store(true, Ordering::SeqCst);
            if let Some(task) = session.event_loop.lock().ok().and_then(|mut h| h.take()) {
                task.abort();
            }
            return Err(BusError::AlreadyConnected);
        }
        *state = SessionState::Connected(session);

        info!(
            host = %self.options.host,
            port = self.options.port,
            client_id = %self.options.client_id,
            "MQTT message bus connected"
        );
        Ok(())
    }

    async fn publish(&self, envelope: MessageEnvelope, topic: &str) -> BusResult<()> {
        let session = self.session()?;
        if topic.is_empty() {
            return Err(BusError::operation("publish", "topic is empty"));
        }
        let payload = serde_json::to_vec(&envelope)?;
        self.publish_bytes(&session, payload, topic).await
    }

    async fn publish_with_size_limit(
        &self,
        envelope: MessageEnvelope,
        topic: &str,
        limit_kb: u64,
    ) -> BusResult<()> {
        let session = self.session()?;
        if topic.is_empty() {
            return Err(BusError::operation("publish", "topic is empty"));
        }
        let payload = serde_json::to_vec(&envelope)?;

        if limit_kb > 0 {
            let limit = usize::try_from(limit_kb.saturating_mul(1024)).unwrap_or(usize::MAX);
            if payload.len() > limit {
                return Err(BusError::PayloadTooLarge {
                    size: payload.len(),
                    limit,
                });
            }
        }
        self.publish_bytes(&session, payload, topic).await
    }

    async fn subscribe(&self, topics: Vec<TopicChannel>, errors: ErrorSender) -> BusResult<()> {
        self.add_routes(topics, errors, false).await
    }

    async fn unsubscribe(&self, topics: &[String]) -> BusResult<()> {
        let session = self.session()?;

        let mut failures = Vec::new();
        for topic in topics {
            let Some(route) = self.routes.lock().await.remove(topic) else {
                continue;
            };
            match session.client.unsubscribe(topic.as_str()).await {
                Ok(()) => debug!(topic = %topic, "Unsubscribed from MQTT topic"),
                Err(e) => {
                    self.routes.lock().await.insert(topic.clone(), route);
                    failures.push(BusError::operation(
                        "unsubscribe",
                        format!("topic '{}': {}", topic, e),
                    ));
                }
            }
        }
        BusError::aggregate(failures)
    }

    async fn disconnect(&self) -> BusResult<()> {
        let session = {
            let mut state = self.session.write().map_err(|_| lock_poisoned("disconnect"))?;
            match std::mem::replace(&mut *state, SessionState::Closed) {
                SessionState::Connected(session) => session,
                previous => {
                    *state = previous;
                    return Err(BusError::NotConnected);
                }
            }
        };

        session.closing.store(true, Ordering::SeqCst);
        let requested = session
            .client
            .disconnect()
            .await
            .map_err(|e| BusError::operation("disconnect", e));

        let task = session
            .event_loop
            .lock()
            .ok()
            .and_then(|mut handle| handle.take());
        if let Some(task) = task {
            if tokio::time::timeout(self.options.connect_timeout, task)
                .await
                .is_err()
            {
                warn!("MQTT event loop did not stop in time");
            }
        }

        self.routes.lock().await.clear();
        requested?;

        info!(host = %self.options.host, "MQTT message bus disconnected");
        Ok(())
    }

    async fn publish_binary_data(&self, data: Bytes, topic: &str) -> BusResult<()> {
        let session = self.session()?;
        if topic.is_empty() {
            return Err(BusError::operation("publish", "topic is empty"));
        }
        self.publish_bytes(&session, data.to_vec(), topic).await
    }

    async fn subscribe_binary_data(
        &self,
        topics: Vec<TopicChannel>,
        errors: ErrorSender,
    ) -> BusResult<()> {
        self.add_routes(topics, errors, true).await
    }
}
