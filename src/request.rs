// Copyright (c) 2025 - Cowboy AI, Inc.
//! Synchronous request/response over publish/subscribe
//!
//! Built only on [`MessageClient::subscribe`], [`MessageClient::publish`] and
//! [`MessageClient::unsubscribe`], so it behaves the same on every backend.
//!
//! ```text
//! caller                     client                        responder
//!   │ request(env, req, pfx)   │                               │
//!   │──subscribe(pfx/ID)──────▶│                               │
//!   │──publish(env, req)──────▶│──────────── env ─────────────▶│
//!   │                          │◀──────── pfx/ID: reply ───────│
//!   │◀────── reply ────────────│                               │
//!   │──unsubscribe(pfx/ID)────▶│                               │
//! ```
//!
//! The response subscription exists before the request is published, so a
//! responder that answers immediately is never missed. Both queues are closed
//! and the response topic is unsubscribed exactly once on success, publish
//! failure, transport error and timeout alike. Nothing here retries;
//! a caller that wants another attempt issues a new request with a new ID.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::MessageClient;
use crate::envelope::{new_request_id, MessageEnvelope, TopicChannel};
use crate::errors::{BusError, BusResult};
use crate::topics::response_topic;

/// Issue `envelope` on `request_topic` and wait up to `timeout` for the reply
///
/// An empty `request_id` is replaced by a generated one, and an empty
/// `correlation_id` takes the same value. The reply is expected on
/// `<response_topic_prefix>/<request_id>`.
pub async fn request<C>(
    client: &C,
    mut envelope: MessageEnvelope,
    request_topic: &str,
    response_topic_prefix: &str,
    timeout: Duration,
) -> BusResult<MessageEnvelope>
where
    C: MessageClient + ?Sized,
{
    if envelope.request_id.is_empty() {
        envelope.request_id = new_request_id();
    }
    if envelope.correlation_id.is_empty() {
        envelope.correlation_id = envelope.request_id.clone();
    }

    let topic = response_topic(response_topic_prefix, &envelope.request_id);
    let (message_tx, messages) = mpsc::channel(1);
    let (error_tx, errors) = mpsc::channel(1);

    client
        .subscribe(vec![TopicChannel::new(topic.clone(), message_tx)], error_tx)
        .await
        .map_err(|e| {
            BusError::operation(
                "request",
                format!("failed to subscribe to response topic '{}': {}", topic, e),
            )
        })?;

    debug!(
        request_id = %envelope.request_id,
        request_topic = %request_topic,
        response_topic = %topic,
        "Awaiting response"
    );

    let mut pending = PendingResponse {
        topic,
        messages,
        errors,
        released: false,
    };
    let outcome = pending.exchange(client, envelope, request_topic, timeout).await;
    pending.release(client).await;
    outcome
}

/// Response subscription owned by one in-flight request
struct PendingResponse {
    topic: String,
    messages: mpsc::Receiver<MessageEnvelope>,
    errors: mpsc::Receiver<BusError>,
    released: bool,
}

impl PendingResponse {
    async fn exchange<C>(
        &mut self,
        client: &C,
        envelope: MessageEnvelope,
        request_topic: &str,
        timeout: Duration,
    ) -> BusResult<MessageEnvelope>
    where
        C: MessageClient + ?Sized,
    {
        client.publish(envelope, request_topic).await?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            biased;
            Some(response) = self.messages.recv() => Ok(response),
            Some(err) = self.errors.recv() => Err(BusError::Transport(format!(
                "error while waiting for response on '{}': {}",
                self.topic, err
            ))),
            _ = &mut deadline => Err(BusError::Timeout { topic: self.topic.clone() }),
        }
    }

    async fn release<C>(mut self, client: &C)
    where
        C: MessageClient + ?Sized,
    {
        self.released = true;
        // Closed first: a delivery blocked on a full queue must fail its send
        // so the backend can stop it during unsubscribe.
        self.messages.close();
        self.errors.close();
        if let Err(e) = client.unsubscribe(std::slice::from_ref(&self.topic)).await {
            warn!(topic = %self.topic, error = %e, "Failed to unsubscribe response topic");
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                topic = %self.topic,
                "Request cancelled before its response subscription was released"
            );
        }
    }
}
