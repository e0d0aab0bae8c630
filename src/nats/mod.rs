// Copyright (c) 2025 - Cowboy AI, Inc.
//! NATS core and JetStream backend
//!
//! [`NatsBusClient`] implements [`MessageClient`] on top of three pieces:
//!
//! - a [`ConnectFn`] that opens a [`Connection`] (core or JetStream),
//! - a [`Marshaller`] chosen by the `Format` option,
//! - a registry of active native subscriptions keyed by topic.
//!
//! Topics in the platform grammar are translated to NATS subjects on the way
//! out; inbound subjects are translated back into `received_topic`.

pub mod connection;
pub mod jetstream;
pub mod marshaller;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::MessageClient;
use crate::config::{MessageBusConfig, TlsOptions};
use crate::envelope::{ErrorSender, MessageEnvelope, TopicChannel};
use crate::errors::{BusError, BusResult};
use crate::topics::topic_to_subject;

pub use connection::{
    core_connect_fn, ConnectFn, Connection, CoreConnection, MessageCallback, NatsMessage,
    NativeSubscription,
};
pub use jetstream::{
    jetstream_connect_fn, ConsumerSpec, DeliverPolicy, JetStreamConnection, StreamCatalog,
};
pub use marshaller::{marshaller_for, Marshaller, WireFormat};

/// Option keys recognized by the NATS backends
pub mod keys {
    pub const CLIENT_ID: &str = "ClientId";
    pub const FORMAT: &str = "Format";
    pub const CONNECT_TIMEOUT: &str = "ConnectTimeout";
    pub const RETRY_ON_FAILED_CONNECT: &str = "RetryOnFailedConnect";
    pub const QUEUE_GROUP: &str = "QueueGroup";
    pub const DURABLE: &str = "Durable";
    pub const SUBJECT: &str = "Subject";
    pub const AUTO_PROVISION: &str = "AutoProvision";
    pub const DELIVER: &str = "Deliver";
    pub const DEFAULT_PUB_RETRY_ATTEMPTS: &str = "DefaultPubRetryAttempts";
    pub const EXACTLY_ONCE: &str = "ExactlyOnce";
    pub const USERNAME: &str = "Username";
    pub const PASSWORD: &str = "Password";
    pub const NKEY_SEED_FILE: &str = "NKeySeedFile";
    pub const CREDENTIALS_FILE: &str = "CredentialsFile";
}

/// NATS backend options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsOptions {
    pub broker_url: String,
    pub client_id: String,
    pub format: WireFormat,
    pub connect_timeout: Duration,
    pub retry_on_failed_connect: bool,
    /// Empty means plain subscriptions without a queue group
    pub queue_group: String,
    pub durable: Option<String>,
    /// Stream subject in topic grammar
    pub subject: String,
    pub auto_provision: bool,
    pub deliver: DeliverPolicy,
    pub default_pub_retry_attempts: u32,
    pub exactly_once: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub nkey_seed_file: Option<String>,
    pub credentials_file: Option<String>,
    pub tls: TlsOptions,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            broker_url: "nats://localhost:4222".to_string(),
            client_id: "cim-messagebus".to_string(),
            format: WireFormat::Native,
            connect_timeout: Duration::from_secs(5),
            retry_on_failed_connect: false,
            queue_group: String::new(),
            durable: None,
            subject: "cim/#".to_string(),
            auto_provision: false,
            deliver: DeliverPolicy::New,
            default_pub_retry_attempts: 2,
            exactly_once: false,
            username: None,
            password: None,
            nkey_seed_file: None,
            credentials_file: None,
            tls: TlsOptions::default(),
        }
    }
}

impl NatsOptions {
    /// Build options from the bus configuration
    ///
    /// Fails with [`BusError::Configuration`] on a missing broker address,
    /// an invalid URL or an unparsable option value.
    pub fn from_config(config: &MessageBusConfig) -> BusResult<Self> {
        config.validate()?;
        let options = config.options();
        let defaults = Self::default();

        let protocol = match config.broker.protocol.trim().to_lowercase().as_str() {
            "" | "tcp" => "nats".to_string(),
            other => other.to_string(),
        };
        let broker_url = format!("{}://{}:{}", protocol, config.broker.host, config.broker.port);
        let parsed = url::Url::parse(&broker_url).map_err(|e| {
            BusError::configuration(format!("invalid NATS broker URL '{}': {}", broker_url, e))
        })?;
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(BusError::configuration(format!(
                "NATS broker URL '{}' has no host",
                broker_url
            )));
        }

        Ok(Self {
            broker_url,
            client_id: options
                .optional_string(keys::CLIENT_ID)
                .unwrap_or_else(|| format!("cim-{}", uuid::Uuid::new_v4())),
            format: options.string(keys::FORMAT, "").parse()?,
            connect_timeout: options.duration(keys::CONNECT_TIMEOUT, defaults.connect_timeout)?,
            retry_on_failed_connect: options.bool(keys::RETRY_ON_FAILED_CONNECT, false)?,
            queue_group: options.string(keys::QUEUE_GROUP, ""),
            durable: options.optional_string(keys::DURABLE),
            subject: options.string(keys::SUBJECT, &defaults.subject),
            auto_provision: options.bool(keys::AUTO_PROVISION, false)?,
            deliver: options.string(keys::DELIVER, "").parse()?,
            default_pub_retry_attempts: options.number(
                keys::DEFAULT_PUB_RETRY_ATTEMPTS,
                defaults.default_pub_retry_attempts,
            )?,
            exactly_once: options.bool(keys::EXACTLY_ONCE, false)?,
            username: options.optional_string(keys::USERNAME),
            password: options.optional_string(keys::PASSWORD),
            nkey_seed_file: options.optional_string(keys::NKEY_SEED_FILE),
            credentials_file: options.optional_string(keys::CREDENTIALS_FILE),
            tls: TlsOptions::from_options(&options)?,
        })
    }
}

enum SessionState {
    Idle,
    Connected(Arc<dyn Connection>),
    Closed,
}

/// [`MessageClient`] for core NATS and JetStream
pub struct NatsBusClient {
    options: NatsOptions,
    connect_fn: Option<ConnectFn>,
    marshaller: Arc<dyn Marshaller>,
    session: RwLock<SessionState>,
    subscriptions: Mutex<HashMap<String, Box<dyn NativeSubscription>>>,
}

impl NatsBusClient {
    /// Client with an explicit connect function
    ///
    /// `None` is accepted so construction never fails; `connect` then
    /// reports the missing function.
    pub fn new(options: NatsOptions, connect_fn: Option<ConnectFn>) -> Self {
        let marshaller: Arc<dyn Marshaller> = Arc::from(marshaller_for(options.format));
        Self {
            options,
            connect_fn,
            marshaller,
            session: RwLock::new(SessionState::Idle),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Core NATS client from configuration
    pub fn core(config: &MessageBusConfig) -> BusResult<Self> {
        Ok(Self::new(
            NatsOptions::from_config(config)?,
            Some(core_connect_fn()),
        ))
    }

    /// JetStream client from configuration
    pub fn jetstream(config: &MessageBusConfig) -> BusResult<Self> {
        Ok(Self::new(
            NatsOptions::from_config(config)?,
            Some(jetstream_connect_fn()),
        ))
    }

    pub fn options(&self) -> &NatsOptions {
        &self.options
    }

    /// True when `topic` has an active subscription
    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().await.contains_key(topic)
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    fn connection(&self) -> BusResult<Arc<dyn Connection>> {
        let state = self
            .session
            .read()
            .map_err(|_| BusError::operation("session", "session state lock poisoned"))?;
        match &*state {
            SessionState::Connected(connection) => Ok(connection.clone()),
            _ => Err(BusError::NotConnected),
        }
    }

    fn marshal(&self, envelope: &MessageEnvelope, topic: &str) -> BusResult<NatsMessage> {
        if topic.is_empty() {
            return Err(BusError::operation("publish", "topic is empty"));
        }
        self.marshaller
            .marshal(envelope, &topic_to_subject(topic))
            .map_err(|e| BusError::operation("publish", e))
    }

    fn delivery_callback(
        &self,
        connection: Arc<dyn Connection>,
        channel: TopicChannel,
        errors: ErrorSender,
    ) -> MessageCallback {
        let marshaller = self.marshaller.clone();
        let exactly_once = self.options.exactly_once;
        let topic = Arc::new(channel.topic);
        let messages = channel.messages;

        Arc::new(move |message: NatsMessage| {
            let marshaller = marshaller.clone();
            let connection = connection.clone();
            let messages = messages.clone();
            let errors = errors.clone();
            let topic = topic.clone();

            async move {
                match marshaller.unmarshal(&message) {
                    Ok(envelope) => {
                        if messages.send(envelope).await.is_err() {
                            debug!(topic = %topic, "Message queue closed, dropping message");
                        }
                    }
                    Err(e) => {
                        warn!(
                            topic = %topic,
                            subject = %message.subject,
                            error = %e,
                            "Failed to decode message"
                        );
                        let _ = errors.send(e).await;
                    }
                }

                if let Some(reply) = &message.reply {
                    if let Err(e) = connection.ack(reply, exactly_once).await {
                        warn!(topic = %topic, error = %e, "Failed to acknowledge message");
                        let _ = errors.send(e).await;
                    }
                }
            }
            .boxed()
        })
    }

    /// Put back a handle whose unsubscribe failed
    ///
    /// A subscription registered for the topic in the meantime wins.
    async fn restore(&self, topic: &str, handle: Box<dyn NativeSubscription>) {
        self.subscriptions
            .lock()
            .await
            .entry(topic.to_string())
            .or_insert(handle);
    }
}

#[async_trait]
impl MessageClient for NatsBusClient {
    async fn connect(&self) -> BusResult<()> {
        {
            let state = self
                .session
                .read()
                .map_err(|_| BusError::operation("connect", "session state lock poisoned"))?;
            if !matches!(*state, SessionState::Idle) {
                return Err(BusError::AlreadyConnected);
            }
        }

        let connect_fn = self
            .connect_fn
            .as_ref()
            .ok_or_else(|| BusError::connection("no connect function configured"))?;
        let connection = connect_fn(self.options.clone()).await?;

        let mut state = self
            .session
            .write()
            .map_err(|_| BusError::operation("connect", "session state lock poisoned"))?;
        if !matches!(*state, SessionState::Idle) {
            return Err(BusError::AlreadyConnected);
        }
        *state = SessionState::Connected(connection);

        info!(url = %self.options.broker_url, format = %self.options.format, "NATS message bus connected");
        Ok(())
    }

    async fn publish(&self, envelope: MessageEnvelope, topic: &str) -> BusResult<()> {
        let connection = self.connection()?;
        let message = self.marshal(&envelope, topic)?;
        connection.publish_msg(message).await
    }

    async fn publish_with_size_limit(
        &self,
        envelope: MessageEnvelope,
        topic: &str,
        limit_kb: u64,
    ) -> BusResult<()> {
        let connection = self.connection()?;
        let message = self.marshal(&envelope, topic)?;

        if limit_kb > 0 {
            let limit = usize::try_from(limit_kb.saturating_mul(1024)).unwrap_or(usize::MAX);
            let size = message.encoded_len();
            if size > limit {
                return Err(BusError::PayloadTooLarge { size, limit });
            }
        }
        connection.publish_msg(message).await
    }

    async fn subscribe(&self, topics: Vec<TopicChannel>, errors: ErrorSender) -> BusResult<()> {
        let connection = self.connection()?;

        // The registry lock is never held across a broker call.
        for channel in topics {
            let topic = channel.topic.clone();
            let subject = topic_to_subject(&topic);

            let previous = self.subscriptions.lock().await.remove(&topic);
            if let Some(mut previous) = previous {
                debug!(topic = %topic, "Replacing existing subscription");
                if let Err(e) = previous.unsubscribe().await {
                    self.restore(&topic, previous).await;
                    return Err(BusError::operation(
                        "subscribe",
                        format!("topic '{}': replacing subscription: {}", topic, e),
                    ));
                }
            }

            let callback = self.delivery_callback(connection.clone(), channel, errors.clone());
            let handle = connection
                .queue_subscribe(&subject, &self.options.queue_group, callback)
                .await
                .map_err(|e| {
                    BusError::operation("subscribe", format!("topic '{}': {}", topic, e))
                })?;

            let displaced = self.subscriptions.lock().await.insert(topic.clone(), handle);
            if let Some(mut displaced) = displaced {
                debug!(topic = %topic, "Concurrent subscribe replaced, stopping the older one");
                if let Err(e) = displaced.unsubscribe().await {
                    warn!(topic = %topic, error = %e, "Failed to stop displaced subscription");
                }
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> BusResult<()> {
        self.connection()?;

        let mut failures = Vec::new();
        for topic in topics {
            let handle = self.subscriptions.lock().await.remove(topic);
            let Some(mut handle) = handle else {
                continue;
            };
            match handle.unsubscribe().await {
                Ok(()) => debug!(topic = %topic, "Unsubscribed"),
                Err(e) => {
                    self.restore(topic, handle).await;
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
        let connection = {
            let mut state = self
                .session
                .write()
                .map_err(|_| BusError::operation("disconnect", "session state lock poisoned"))?;
            match std::mem::replace(&mut *state, SessionState::Closed) {
                SessionState::Connected(connection) => connection,
                previous => {
                    *state = previous;
                    return Err(BusError::NotConnected);
                }
            }
        };

        let drained = connection.drain().await;
        self.subscriptions.lock().await.clear();
        drained?;

        info!(url = %self.options.broker_url, "NATS message bus disconnected");
        Ok(())
    }
}
