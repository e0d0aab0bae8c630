// Copyright (c) 2025 - Cowboy AI, Inc.
//! Broker-agnostic message client contract
//!
//! Every backend (MQTT, core NATS, NATS JetStream) implements
//! [`MessageClient`]. Services hold an `Arc<dyn MessageClient>` and never see
//! broker types.
//!
//! # Lifecycle
//!
//! ```text
//! new ──connect()──▶ connected ──disconnect()──▶ closed
//!  │                    │
//!  └─ every operation   └─ publish / subscribe / unsubscribe / request
//!     fails NotConnected
//! ```
//!
//! `connect` may succeed at most once per instance; a second call returns
//! [`BusError::AlreadyConnected`]. `disconnect` is terminal.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::envelope::{ErrorSender, MessageEnvelope, TopicChannel};
use crate::errors::{BusError, BusResult};

/// Publish/subscribe client over one broker session
#[async_trait]
pub trait MessageClient: Send + Sync {
    /// Establish the broker session
    async fn connect(&self) -> BusResult<()>;

    /// Publish an envelope to `topic`
    async fn publish(&self, envelope: MessageEnvelope, topic: &str) -> BusResult<()>;

    /// Publish only if the marshalled envelope is at most `limit_kb * 1024` bytes
    ///
    /// A limit of 0 disables the check.
    async fn publish_with_size_limit(
        &self,
        envelope: MessageEnvelope,
        topic: &str,
        limit_kb: u64,
    ) -> BusResult<()>;

    /// Create one subscription per channel
    ///
    /// Decoded envelopes go to each channel's message queue. Decode and
    /// transport failures go to `errors`, never to a message queue.
    async fn subscribe(&self, topics: Vec<TopicChannel>, errors: ErrorSender) -> BusResult<()>;

    /// Remove subscriptions
    ///
    /// Unknown topics are skipped. Every topic is attempted; failures are
    /// combined into one [`BusError::Aggregate`].
    async fn unsubscribe(&self, topics: &[String]) -> BusResult<()>;

    /// Drain outstanding deliveries and close the session
    async fn disconnect(&self) -> BusResult<()>;

    /// Publish a request and wait for the correlated response
    ///
    /// See [`crate::request::request`] for the ordering and cleanup guarantees.
    ///
    /// Cleanup runs only when the returned future completes. A future dropped
    /// early, for example by losing a `select!` or an outer
    /// `tokio::time::timeout`, leaves `<response_topic_prefix>/<request_id>`
    /// subscribed until that topic is unsubscribed or the client disconnects.
    /// Bound the wait with `timeout` instead.
    async fn request(
        &self,
        envelope: MessageEnvelope,
        request_topic: &str,
        response_topic_prefix: &str,
        timeout: Duration,
    ) -> BusResult<MessageEnvelope> {
        crate::request::request(self, envelope, request_topic, response_topic_prefix, timeout)
            .await
    }

    /// Publish raw bytes without an envelope
    async fn publish_binary_data(&self, _data: Bytes, _topic: &str) -> BusResult<()> {
        Err(BusError::Unsupported(
            "binary data publishing is not supported by this message bus".to_string(),
        ))
    }

    /// Subscribe to raw bytes; each body arrives as an envelope payload
    async fn subscribe_binary_data(
        &self,
        _topics: Vec<TopicChannel>,
        _errors: ErrorSender,
    ) -> BusResult<()> {
        Err(BusError::Unsupported(
            "binary data subscriptions are not supported by this message bus".to_string(),
        ))
    }
}
