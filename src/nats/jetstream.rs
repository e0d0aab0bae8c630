// Copyright (c) 2025 - Cowboy AI, Inc.

//! JetStream session, stream provisioning and acknowledgment
//!
//! A JetStream session differs from core NATS in three ways:
//!
//! - **Publishing** goes through the JetStream context and waits for the
//!   stream's publish ack.
//! - **Subscribing** queue-subscribes on a deliver subject, then binds a push
//!   consumer (explicit acks, configured deliver policy) on the stream that
//!   covers the subject. Unsubscribing deletes the consumer again unless it
//!   is shared through a queue group.
//! - **Acknowledging** is real: `+ACK` is published on the delivery's reply
//!   subject, or requested and confirmed when exactly-once is configured.
//!
//! # Stream provisioning
//!
//! With `AutoProvision` enabled, connecting checks whether a stream already
//! covers the configured subject and creates one when none does:
//!
//! ```text
//! Subject option   cim/#            (topic grammar)
//! NATS subject     cim.>
//! Stream name      <Durable>        when configured
//!                  cim              otherwise (derived from the subject)
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream};
use async_nats::Client;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info, warn};

use crate::errors::{BusError, BusResult};
use crate::topics::{subject_to_stream_name, topic_to_subject};

use super::connection::{
    ack_on_reply, connect_client, ConnectFn, Connection, CoreConnection, MessageCallback,
    NatsMessage, NativeSubscription,
};
use super::NatsOptions;

/// Where a new consumer starts reading its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Deliver only messages published after the consumer was created
    #[default]
    New,
    /// Deliver all messages from the stream start
    All,
    /// Deliver the last message in the stream, then new ones
    Last,
    /// Deliver the last message for each subject, then new ones
    LastPerSubject,
}

impl FromStr for DeliverPolicy {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "new" => Ok(DeliverPolicy::New),
            "all" => Ok(DeliverPolicy::All),
            "last" => Ok(DeliverPolicy::Last),
            "lastpersubject" => Ok(DeliverPolicy::LastPerSubject),
            other => Err(BusError::configuration(format!(
                "unknown deliver policy '{}', expected new, all, last or lastpersubject",
                other
            ))),
        }
    }
}

impl fmt::Display for DeliverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliverPolicy::New => write!(f, "new"),
            DeliverPolicy::All => write!(f, "all"),
            DeliverPolicy::Last => write!(f, "last"),
            DeliverPolicy::LastPerSubject => write!(f, "lastpersubject"),
        }
    }
}

impl From<DeliverPolicy> for consumer::DeliverPolicy {
    fn from(policy: DeliverPolicy) -> Self {
        match policy {
            DeliverPolicy::New => consumer::DeliverPolicy::New,
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::Last => consumer::DeliverPolicy::Last,
            DeliverPolicy::LastPerSubject => consumer::DeliverPolicy::LastPerSubject,
        }
    }
}

/// Idle time after which the server removes a consumer bound without `Durable`
pub const EPHEMERAL_CONSUMER_INACTIVE_THRESHOLD: Duration = Duration::from_secs(30);

/// The stream and consumer management subscriptions and provisioning need
#[async_trait]
pub trait StreamCatalog: Send + Sync {
    /// Name of the stream capturing `subject`, if any
    async fn stream_for_subject(&self, subject: &str) -> BusResult<Option<String>>;

    /// Create a file-backed stream capturing `subject`
    async fn create_stream(&self, name: &str, subject: &str) -> BusResult<()>;

    /// Create the push consumer described by `spec`, or reuse an identical one
    async fn create_consumer(&self, spec: &ConsumerSpec) -> BusResult<()>;

    async fn delete_consumer(&self, stream: &str, name: &str) -> BusResult<()>;
}

/// Ensure a stream covers the configured subject, returning its name
pub async fn provision_stream(
    catalog: &dyn StreamCatalog,
    options: &NatsOptions,
) -> BusResult<String> {
    let subject = topic_to_subject(&options.subject);

    if let Some(existing) = catalog.stream_for_subject(&subject).await? {
        info!(stream = %existing, subject = %subject, "Found existing JetStream stream");
        return Ok(existing);
    }

    let name = options
        .durable
        .clone()
        .unwrap_or_else(|| subject_to_stream_name(&subject));
    if name.is_empty() {
        return Err(BusError::configuration(format!(
            "cannot derive a stream name from subject '{}'",
            subject
        )));
    }

    info!(stream = %name, subject = %subject, "Creating JetStream stream");
    catalog.create_stream(&name, &subject).await?;
    Ok(name)
}

/// True when the stream subject `pattern` captures every message on `subject`
///
/// `subject` may itself contain wildcards; a wildcard is only covered by a
/// wildcard at least as wide.
pub fn subject_covers(pattern: &str, subject: &str) -> bool {
    let mut patterns = pattern.split('.');
    let mut subjects = subject.split('.');
    loop {
        match (patterns.next(), subjects.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(s)) if s != ">" => {}
            (Some(p), Some(s)) if p == s && s != "*" && s != ">" => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Name of the consumer bound for one subscribed subject
///
/// With `Durable` set the name is shared by every client using that durable
/// name. Without it the client id is appended so each client owns its own
/// consumer.
pub fn consumer_name(durable: Option<&str>, client_id: &str, subject: &str) -> String {
    let derived = subject_to_stream_name(subject);
    match durable {
        Some(durable) => format!("{}_{}", durable, derived),
        None => {
            let client: String = client_id
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
                .collect();
            format!("{}_{}", derived, client)
        }
    }
}

/// Push consumer bound for one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub stream: String,
    pub name: String,
    pub deliver_subject: String,
    pub deliver_group: Option<String>,
    pub filter_subject: String,
    pub deliver: DeliverPolicy,
    /// Set when `Durable` is unset; the server then removes the consumer
    /// once nothing listens on its deliver subject
    pub inactive_threshold: Option<Duration>,
}

impl ConsumerSpec {
    pub fn new(options: &NatsOptions, stream: &str, subject: &str, queue: &str) -> Self {
        let name = consumer_name(options.durable.as_deref(), &options.client_id, subject);
        Self {
            stream: stream.to_string(),
            deliver_subject: format!("_deliver.{}", name),
            name,
            deliver_group: (!queue.is_empty()).then(|| queue.to_string()),
            filter_subject: subject.to_string(),
            deliver: options.deliver,
            inactive_threshold: options
                .durable
                .is_none()
                .then_some(EPHEMERAL_CONSUMER_INACTIVE_THRESHOLD),
        }
    }

    /// Consumers bound without a queue group belong to this subscription
    /// alone and are deleted with it
    pub fn owned(&self) -> bool {
        self.deliver_group.is_none()
    }

    fn push_config(&self) -> consumer::push::Config {
        consumer::push::Config {
            deliver_subject: self.deliver_subject.clone(),
            durable_name: Some(self.name.clone()),
            deliver_group: self.deliver_group.clone(),
            filter_subject: self.filter_subject.clone(),
            deliver_policy: self.deliver.into(),
            ack_policy: consumer::AckPolicy::Explicit,
            inactive_threshold: self.inactive_threshold.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Subscription on a consumer's deliver subject
///
/// Unsubscribing stops delivery, then deletes the consumer when this
/// subscription owns it. Drain leaves consumers in place.
pub struct ConsumerSubscription {
    delivery: Box<dyn NativeSubscription>,
    catalog: Arc<dyn StreamCatalog>,
    spec: ConsumerSpec,
}

impl ConsumerSubscription {
    pub fn new(
        delivery: Box<dyn NativeSubscription>,
        catalog: Arc<dyn StreamCatalog>,
        spec: ConsumerSpec,
    ) -> Self {
        Self {
            delivery,
            catalog,
            spec,
        }
    }
}

#[async_trait]
impl NativeSubscription for ConsumerSubscription {
    async fn unsubscribe(&mut self) -> BusResult<()> {
        self.delivery.unsubscribe().await?;
        if self.spec.owned() {
            self.catalog
                .delete_consumer(&self.spec.stream, &self.spec.name)
                .await?;
            debug!(
                stream = %self.spec.stream,
                consumer = %self.spec.name,
                "Deleted JetStream consumer"
            );
        }
        Ok(())
    }
}

/// [`StreamCatalog`] backed by a live JetStream context
pub struct JetStreamCatalog {
    context: jetstream::Context,
}

impl JetStreamCatalog {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }

    async fn stream(&self, name: &str) -> BusResult<stream::Stream> {
        self.context
            .get_stream(name)
            .await
            .map_err(|e| BusError::operation("jetstream", format!("stream '{}': {}", name, e)))
    }
}

#[async_trait]
impl StreamCatalog for JetStreamCatalog {
    async fn stream_for_subject(&self, subject: &str) -> BusResult<Option<String>> {
        let names = self.context.stream_names();
        tokio::pin!(names);
        while let Some(name) = names.next().await {
            let name = name
                .map_err(|e| BusError::operation("jetstream", format!("list streams: {}", e)))?;
            let stream = self.stream(&name).await?;
            let covered = stream
                .cached_info()
                .config
                .subjects
                .iter()
                .any(|pattern| subject_covers(pattern, subject));
            if covered {
                return Ok(Some(name));
            }
        }
        debug!(subject = %subject, "No stream found for subject");
        Ok(None)
    }

    async fn create_stream(&self, name: &str, subject: &str) -> BusResult<()> {
        let config = stream::Config {
            name: name.to_string(),
            subjects: vec![subject.to_string()],
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::Limits,
            num_replicas: 1,
            ..Default::default()
        };

        self.context
            .create_stream(config)
            .await
            .map_err(|e| BusError::connection(format!("create stream '{}': {}", name, e)))?;
        Ok(())
    }

    async fn create_consumer(&self, spec: &ConsumerSpec) -> BusResult<()> {
        self.stream(&spec.stream)
            .await?
            .create_consumer(spec.push_config())
            .await
            .map_err(|e| BusError::operation("subscribe", e))?;
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> BusResult<()> {
        self.stream(stream)
            .await?
            .delete_consumer(name)
            .await
            .map_err(|e| BusError::operation("unsubscribe", format!("consumer '{}': {}", name, e)))?;
        Ok(())
    }
}

/// Connect function for NATS JetStream
pub fn jetstream_connect_fn() -> ConnectFn {
    Arc::new(|options: NatsOptions| {
        async move {
            let client = connect_client(&options).await?;
            let connection = JetStreamConnection::new(client, options);
            if connection.options.auto_provision {
                provision_stream(connection.catalog.as_ref(), &connection.options).await?;
            }
            Ok(Arc::new(connection) as Arc<dyn Connection>)
        }
        .boxed()
    })
}

/// JetStream session layered over a core session
pub struct JetStreamConnection {
    core: CoreConnection,
    context: jetstream::Context,
    catalog: Arc<dyn StreamCatalog>,
    options: NatsOptions,
}

impl JetStreamConnection {
    pub fn new(client: Client, options: NatsOptions) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            core: CoreConnection::new(client),
            catalog: Arc::new(JetStreamCatalog::new(context.clone())),
            context,
            options,
        }
    }

    async fn publish_once(&self, message: &NatsMessage) -> BusResult<()> {
        let headers = message
            .headers
            .iter()
            .fold(async_nats::HeaderMap::new(), |mut map, (k, v)| {
                map.insert(k.as_str(), v.as_str());
                map
            });

        self.context
            .publish_with_headers(message.subject.clone(), headers, message.payload.clone())
            .await
            .map_err(|e| BusError::operation("publish", e))?
            .await
            .map_err(|e| BusError::operation("publish", e))?;
        Ok(())
    }
}

#[async_trait]
impl Connection for JetStreamConnection {
    async fn publish_msg(&self, message: NatsMessage) -> BusResult<()> {
        let attempts = self.options.default_pub_retry_attempts;
        let mut attempt = 0;
        loop {
            match self.publish_once(&message).await {
                Ok(()) => {
                    debug!(subject = %message.subject, "Published message to JetStream");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    attempt += 1;
                    warn!(
                        subject = %message.subject,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "JetStream publish failed, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        callback: MessageCallback,
    ) -> BusResult<Box<dyn NativeSubscription>> {
        let stream_name = self
            .catalog
            .stream_for_subject(subject)
            .await?
            .ok_or_else(|| {
                BusError::operation("subscribe", format!("no stream covers '{}'", subject))
            })?;
        let spec = ConsumerSpec::new(&self.options, &stream_name, subject, queue);

        // Listen on the deliver subject before the consumer starts pushing.
        let mut delivery = self
            .core
            .queue_subscribe(&spec.deliver_subject, queue, callback)
            .await?;
        if let Err(e) = self.catalog.create_consumer(&spec).await {
            if let Err(stop) = delivery.unsubscribe().await {
                debug!(subject = %spec.deliver_subject, error = %stop, "Failed to stop delivery");
            }
            return Err(e);
        }

        info!(
            stream = %spec.stream,
            consumer = %spec.name,
            subject = %subject,
            deliver = %spec.deliver,
            "Bound JetStream consumer"
        );
        Ok(Box::new(ConsumerSubscription::new(
            delivery,
            self.catalog.clone(),
            spec,
        )))
    }

    async fn ack(&self, reply: &str, wait_for_confirm: bool) -> BusResult<()> {
        ack_on_reply(self.core.client(), reply, wait_for_confirm).await
    }

    async fn drain(&self) -> BusResult<()> {
        self.core.drain().await
    }
}
