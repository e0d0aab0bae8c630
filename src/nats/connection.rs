// Copyright (c) 2025 - Cowboy AI, Inc.
//! NATS connection capability set
//!
//! [`Connection`] is the narrow surface the backend client needs from a
//! broker session: publish one message, queue-subscribe with a callback,
//! acknowledge, and drain. Sessions are created by a [`ConnectFn`], so tests
//! can hand the client a fake connection instead of a live server.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::{Client, ConnectOptions, HeaderMap, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{BusError, BusResult};

use super::marshaller::HEADER_KEYS;
use super::NatsOptions;

/// Upper bound on waiting for a delivery task during unsubscribe or drain
const DELIVERY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker-neutral view of one NATS message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsMessage {
    pub subject: String,
    /// Reply address; JetStream deliveries carry their ack subject here
    pub reply: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl NatsMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Size checked by size-limited publishes: the body length
    pub fn encoded_len(&self) -> usize {
        self.payload.len()
    }

    fn header_map(&self) -> Option<HeaderMap> {
        if self.headers.is_empty() {
            return None;
        }
        let mut map = HeaderMap::new();
        for (key, value) in &self.headers {
            map.insert(key.as_str(), value.as_str());
        }
        Some(map)
    }
}

impl From<async_nats::Message> for NatsMessage {
    fn from(message: async_nats::Message) -> Self {
        let mut headers = BTreeMap::new();
        if let Some(map) = &message.headers {
            for key in HEADER_KEYS {
                if let Some(value) = map.get(*key) {
                    headers.insert(key.to_string(), value.as_str().to_string());
                }
            }
        }
        Self {
            subject: message.subject.to_string(),
            reply: message.reply.map(|r| r.to_string()),
            headers,
            payload: message.payload,
        }
    }
}

/// Invoked once per inbound message; the delivery task awaits it
pub type MessageCallback = Arc<dyn Fn(NatsMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Opens a broker session from backend options
pub type ConnectFn =
    Arc<dyn Fn(NatsOptions) -> BoxFuture<'static, BusResult<Arc<dyn Connection>>> + Send + Sync>;

/// Handle to one active native subscription
#[async_trait]
pub trait NativeSubscription: Send + Sync {
    async fn unsubscribe(&mut self) -> BusResult<()>;
}

/// Broker session used by [`super::NatsBusClient`]
#[async_trait]
pub trait Connection: Send + Sync {
    async fn publish_msg(&self, message: NatsMessage) -> BusResult<()>;

    /// Subscribe to `subject`; an empty `queue` means no queue group
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        callback: MessageCallback,
    ) -> BusResult<Box<dyn NativeSubscription>>;

    /// Acknowledge a delivery through its reply address
    ///
    /// With `wait_for_confirm` the call returns only after the broker has
    /// confirmed the ack.
    async fn ack(&self, reply: &str, wait_for_confirm: bool) -> BusResult<()>;

    /// Let in-hand deliveries finish, stop every subscription and flush
    async fn drain(&self) -> BusResult<()>;
}

/// Connect function for core NATS
pub fn core_connect_fn() -> ConnectFn {
    Arc::new(|options: NatsOptions| {
        async move {
            let client = connect_client(&options).await?;
            Ok(Arc::new(CoreConnection::new(client)) as Arc<dyn Connection>)
        }
        .boxed()
    })
}

/// Open an async-nats client from backend options
pub(crate) async fn connect_client(options: &NatsOptions) -> BusResult<Client> {
    let mut connect_options = ConnectOptions::new()
        .name(&options.client_id)
        .connection_timeout(options.connect_timeout);

    if options.retry_on_failed_connect {
        connect_options = connect_options.retry_on_initial_connect();
    }
    if let (Some(user), Some(password)) = (&options.username, &options.password) {
        connect_options = connect_options.user_and_password(user.clone(), password.clone());
    }
    if let Some(path) = &options.credentials_file {
        connect_options = connect_options
            .credentials_file(path)
            .await
            .map_err(|e| BusError::connection(format!("credentials file '{}': {}", path, e)))?;
    }
    if let Some(path) = &options.nkey_seed_file {
        let seed = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BusError::connection(format!("nkey seed file '{}': {}", path, e)))?;
        connect_options = connect_options.nkey(seed.trim().to_string());
    }
    if options.tls.is_configured() {
        connect_options = connect_options.require_tls(true);
        if let Some(ca) = &options.tls.ca_file {
            connect_options = connect_options.add_root_certificates(ca.into());
        }
        if let (Some(cert), Some(key)) = (&options.tls.cert_file, &options.tls.key_file) {
            connect_options = connect_options.add_client_certificate(cert.into(), key.into());
        }
    }
    if options.tls.skip_cert_verify {
        warn!("SkipCertVerify is not supported by the NATS backend and is ignored");
    }

    let client = async_nats::connect_with_options(options.broker_url.as_str(), connect_options)
        .await
        .map_err(|e| BusError::connection(format!("{}: {}", options.broker_url, e)))?;

    info!(url = %options.broker_url, client_id = %options.client_id, "Connected to NATS");
    Ok(client)
}

/// Core NATS session
///
/// Each subscription runs one delivery task that awaits the callback for
/// every message before taking the next. Core NATS has no acknowledgments,
/// so [`Connection::ack`] is a no-op here.
pub struct CoreConnection {
    client: Client,
    draining: watch::Sender<bool>,
    deliveries: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreConnection {
    pub fn new(client: Client) -> Self {
        let (draining, _) = watch::channel(false);
        Self {
            client,
            draining,
            deliveries: Mutex::new(Vec::new()),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Start a delivery task for an established subscriber
    fn spawn_delivery(
        &self,
        subscriber: Subscriber,
        subject: &str,
        callback: MessageCallback,
    ) -> Box<dyn NativeSubscription> {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let draining = self.draining.subscribe();
        let subject = subject.to_string();

        let task = tokio::spawn(async move {
            deliver(subscriber, &subject, callback, stop_rx, draining).await;
            let _ = done_tx.send(());
        });

        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.retain(|handle| !handle.is_finished());
            deliveries.push(task);
        }

        Box::new(CoreSubscription {
            stop: Some(stop_tx),
            done: Some(done_rx),
        })
    }
}

#[async_trait]
impl Connection for CoreConnection {
    async fn publish_msg(&self, message: NatsMessage) -> BusResult<()> {
        let result = match message.header_map() {
            Some(headers) => {
                self.client
                    .publish_with_headers(message.subject.clone(), headers, message.payload)
                    .await
            }
            None => {
                self.client
                    .publish(message.subject.clone(), message.payload)
                    .await
            }
        };
        result.map_err(|e| BusError::operation("publish", e))?;

        debug!(subject = %message.subject, "Published message");
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        callback: MessageCallback,
    ) -> BusResult<Box<dyn NativeSubscription>> {
        let subscriber = if queue.is_empty() {
            self.client.subscribe(subject.to_string()).await
        } else {
            self.client
                .queue_subscribe(subject.to_string(), queue.to_string())
                .await
        }
        .map_err(|e| BusError::operation("subscribe", e))?;

        info!(subject = %subject, queue = %queue, "Subscribed to subject");
        Ok(self.spawn_delivery(subscriber, subject, callback))
    }

    async fn ack(&self, _reply: &str, _wait_for_confirm: bool) -> BusResult<()> {
        Ok(())
    }

    async fn drain(&self) -> BusResult<()> {
        let _ = self.draining.send(true);

        let deliveries = match self.deliveries.lock() {
            Ok(mut deliveries) => std::mem::take(&mut *deliveries),
            Err(_) => Vec::new(),
        };
        for task in deliveries {
            if tokio::time::timeout(DELIVERY_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Delivery task did not finish draining in time");
            }
        }

        self.client
            .flush()
            .await
            .map_err(|e| BusError::operation("drain", e))?;

        info!("Drained NATS connection");
        Ok(())
    }
}

/// Acknowledge a JetStream delivery on its reply subject
pub(crate) async fn ack_on_reply(
    client: &Client,
    reply: &str,
    wait_for_confirm: bool,
) -> BusResult<()> {
    const ACK: &[u8] = b"+ACK";
    if wait_for_confirm {
        client
            .request(reply.to_string(), Bytes::from_static(ACK))
            .await
            .map_err(|e| BusError::operation("ack", e))?;
    } else {
        client
            .publish(reply.to_string(), Bytes::from_static(ACK))
            .await
            .map_err(|e| BusError::operation("ack", e))?;
    }
    Ok(())
}

enum StopReason {
    Unsubscribe,
    Drain,
}

async fn deliver(
    mut subscriber: Subscriber,
    subject: &str,
    callback: MessageCallback,
    mut stop: oneshot::Receiver<()>,
    mut draining: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            biased;
            _ = &mut stop => break StopReason::Unsubscribe,
            _ = draining.changed() => break StopReason::Drain,
            next = subscriber.next() => match next {
                Some(message) => callback(NatsMessage::from(message)).await,
                None => {
                    debug!(subject = %subject, "Subscription closed by server");
                    return;
                }
            },
        }
    };

    if let Err(e) = subscriber.unsubscribe().await {
        debug!(subject = %subject, error = %e, "Unsubscribe on shutdown failed");
    }

    if let StopReason::Drain = reason {
        // Messages already buffered for this subscriber are still handed out.
        let drained = tokio::time::timeout(DELIVERY_SHUTDOWN_TIMEOUT, async {
            while let Some(message) = subscriber.next().await {
                callback(NatsMessage::from(message)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(subject = %subject, "Gave up draining buffered messages");
        }
    }

    debug!(subject = %subject, "Delivery task stopped");
}

struct CoreSubscription {
    stop: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl NativeSubscription for CoreSubscription {
    async fn unsubscribe(&mut self) -> BusResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(done) = self.done.take() {
            // A closed channel means the task already ended.
            if tokio::time::timeout(DELIVERY_SHUTDOWN_TIMEOUT, done).await.is_err() {
                return Err(BusError::operation(
                    "unsubscribe",
                    "delivery task did not stop",
                ));
            }
        }
        Ok(())
    }
}
