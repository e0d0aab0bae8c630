// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for cim-messagebus
//!
//! In-memory stand-ins for a broker so request/response and backend client
//! behavior can be tested without a running server.
//!
//! - [`FakeBus`] implements `MessageClient` directly and records every call.
//! - [`FakeState`] backs a fake NATS `Connection` handed to `NatsBusClient`
//!   through a connect function.
//! - [`TaskState`] backs a fake `Connection` that, like the live session,
//!   runs one delivery task per subscription and waits for it on
//!   unsubscribe.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Notify};

use cim_messagebus::envelope::{content_type, ErrorSender, MessageEnvelope, TopicChannel};
use cim_messagebus::nats::{
    ConnectFn, Connection, MessageCallback, NatsBusClient, NatsMessage, NatsOptions,
    NativeSubscription, WireFormat,
};
use cim_messagebus::topics::response_topic;
use cim_messagebus::{BusError, BusResult, MessageClient};

pub const REQUEST_ID_1: &str = "7d1c1c9e-0001-4000-8000-000000000001";
pub const CORRELATION_ID_1: &str = "7d1c1c9e-c001-4000-8000-00000000c001";
pub const RESPONSE_PREFIX: &str = "cim/response/core-command";
pub const REQUEST_TOPIC: &str = "cim/core-command/request/pump-1/speed/get";

/// Envelope with fixed identifiers
pub fn request_fixture() -> MessageEnvelope {
    let mut envelope = MessageEnvelope::new(r#"{"speed":1200}"#, content_type::JSON);
    envelope.request_id = REQUEST_ID_1.to_string();
    envelope.correlation_id = CORRELATION_ID_1.to_string();
    envelope
}

/// One recorded call on [`FakeBus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe(String),
    Publish(String),
    Unsubscribe(String),
}

/// Builds a reply to a published request
pub type Responder = Box<dyn Fn(&MessageEnvelope) -> Option<MessageEnvelope> + Send + Sync>;

/// In-memory `MessageClient`
///
/// A configured responder answers each publish synchronously on
/// `<prefix>/<request id>`. The answer is lost when no subscription for that
/// topic exists at publish time, exactly like a real broker.
#[derive(Default)]
pub struct FakeBus {
    subscriptions: Mutex<HashMap<String, (mpsc::Sender<MessageEnvelope>, ErrorSender)>>,
    calls: Mutex<Vec<Call>>,
    responder: Option<(String, Responder)>,
    pub fail_publish: AtomicBool,
    pub fail_subscribe: AtomicBool,
    /// Push a transport error to the response subscription instead of answering
    pub error_on_publish: AtomicBool,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request with `respond`
    pub fn with_responder<F>(prefix: &str, respond: F) -> Self
    where
        F: Fn(&MessageEnvelope) -> Option<MessageEnvelope> + Send + Sync + 'static,
    {
        Self {
            responder: Some((prefix.to_string(), Box::new(respond))),
            ..Self::default()
        }
    }

    /// Echo each request's payload back as a successful response
    pub fn echo(prefix: &str) -> Self {
        Self::with_responder(prefix, |request| {
            Some(MessageEnvelope::for_response(
                request,
                request.payload.clone(),
                request.content_type.clone(),
            ))
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == Call::Unsubscribe(topic.to_string()))
            .count()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MessageClient for FakeBus {
    async fn connect(&self) -> BusResult<()> {
        Ok(())
    }

    async fn publish(&self, envelope: MessageEnvelope, topic: &str) -> BusResult<()> {
        self.record(Call::Publish(topic.to_string()));
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::operation("publish", "broker rejected message"));
        }

        let Some((prefix, respond)) = &self.responder else {
            return Ok(());
        };
        let reply_topic = response_topic(prefix, &envelope.request_id);
        let target = self.subscriptions.lock().unwrap().get(&reply_topic).cloned();
        let Some((messages, errors)) = target else {
            return Ok(());
        };

        if self.error_on_publish.load(Ordering::SeqCst) {
            let _ = errors.try_send(BusError::Transport("connection reset".to_string()));
        } else if let Some(mut reply) = respond(&envelope) {
            reply.received_topic = reply_topic;
            let _ = messages.try_send(reply);
        }
        Ok(())
    }

    async fn publish_with_size_limit(
        &self,
        envelope: MessageEnvelope,
        topic: &str,
        _limit_kb: u64,
    ) -> BusResult<()> {
        self.publish(envelope, topic).await
    }

    async fn subscribe(&self, topics: Vec<TopicChannel>, errors: ErrorSender) -> BusResult<()> {
        for channel in topics {
            self.record(Call::Subscribe(channel.topic.clone()));
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(BusError::operation("subscribe", "broker refused subscription"));
            }
            self.subscriptions
                .lock()
                .unwrap()
                .insert(channel.topic, (channel.messages, errors.clone()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> BusResult<()> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        for topic in topics {
            if subscriptions.remove(topic).is_some() {
                self.calls
                    .lock()
                    .unwrap()
                    .push(Call::Unsubscribe(topic.clone()));
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        self.subscriptions.lock().unwrap().clear();
        Ok(())
    }
}

/// Builds a reply to a published NATS message
pub type NatsResponder = Box<dyn Fn(&NatsMessage) -> Option<NatsMessage> + Send + Sync>;

/// Shared state behind [`FakeConnection`]
#[derive(Default)]
pub struct FakeState {
    pub published: Mutex<Vec<NatsMessage>>,
    /// subject -> (queue group, callback)
    pub subscriptions: Mutex<HashMap<String, (String, MessageCallback)>>,
    pub unsubscribed: Mutex<Vec<String>>,
    pub acks: Mutex<Vec<(String, bool)>>,
    pub fail_unsubscribe: Mutex<HashSet<String>>,
    pub connects: AtomicUsize,
    pub drained: AtomicBool,
    pub responder: Mutex<Option<NatsResponder>>,
}

impl FakeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn fail_unsubscribe_for(&self, subject: &str) {
        self.fail_unsubscribe
            .lock()
            .unwrap()
            .insert(subject.to_string());
    }

    pub fn set_responder<F>(&self, respond: F)
    where
        F: Fn(&NatsMessage) -> Option<NatsMessage> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(respond));
    }

    /// Hand `message` to the subscription on its own subject
    ///
    /// Returns false when nothing is subscribed to that subject.
    pub async fn deliver(&self, message: NatsMessage) -> bool {
        let subject = message.subject.clone();
        self.deliver_to(&subject, message).await
    }

    /// Hand `message` to the subscription registered for `subscription`
    pub async fn deliver_to(&self, subscription: &str, message: NatsMessage) -> bool {
        let callback = self
            .subscriptions
            .lock()
            .unwrap()
            .get(subscription)
            .map(|(_, callback)| callback.clone());
        match callback {
            Some(callback) => {
                callback(message).await;
                true
            }
            None => false,
        }
    }
}

/// Fake broker session recording everything the client asks of it
pub struct FakeConnection(pub Arc<FakeState>);

#[async_trait]
impl Connection for FakeConnection {
    async fn publish_msg(&self, message: NatsMessage) -> BusResult<()> {
        self.0.published.lock().unwrap().push(message.clone());
        let reply = self
            .0
            .responder
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|respond| respond(&message));
        if let Some(reply) = reply {
            self.0.deliver(reply).await;
        }
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        callback: MessageCallback,
    ) -> BusResult<Box<dyn NativeSubscription>> {
        self.0
            .subscriptions
            .lock()
            .unwrap()
            .insert(subject.to_string(), (queue.to_string(), callback));
        Ok(Box::new(FakeSubscription {
            state: self.0.clone(),
            subject: subject.to_string(),
        }))
    }

    async fn ack(&self, reply: &str, wait_for_confirm: bool) -> BusResult<()> {
        self.0
            .acks
            .lock()
            .unwrap()
            .push((reply.to_string(), wait_for_confirm));
        Ok(())
    }

    async fn drain(&self) -> BusResult<()> {
        self.0.subscriptions.lock().unwrap().clear();
        self.0.drained.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeSubscription {
    state: Arc<FakeState>,
    subject: String,
}

#[async_trait]
impl NativeSubscription for FakeSubscription {
    async fn unsubscribe(&mut self) -> BusResult<()> {
        if self.state.fail_unsubscribe.lock().unwrap().contains(&self.subject) {
            return Err(BusError::Transport(format!(
                "server rejected unsubscribe for '{}'",
                self.subject
            )));
        }
        self.state.subscriptions.lock().unwrap().remove(&self.subject);
        self.state
            .unsubscribed
            .lock()
            .unwrap()
            .push(self.subject.clone());
        Ok(())
    }
}

/// Connect function handing out sessions over `state`
pub fn fake_connect_fn(state: Arc<FakeState>) -> ConnectFn {
    Arc::new(move |_options: NatsOptions| {
        let state = state.clone();
        async move {
            state.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeConnection(state)) as Arc<dyn Connection>)
        }
        .boxed()
    })
}

/// Connected NATS client over a fake session
pub async fn connected_nats_client(options: NatsOptions) -> (NatsBusClient, Arc<FakeState>) {
    let state = FakeState::new();
    let client = NatsBusClient::new(options, Some(fake_connect_fn(state.clone())));
    client.connect().await.unwrap();
    (client, state)
}

/// Options using the native header codec
pub fn native_options() -> NatsOptions {
    NatsOptions {
        format: WireFormat::Native,
        ..NatsOptions::default()
    }
}

/// How long a [`TaskConnection`] subscription waits for its delivery task
pub const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds any number of replies to a published NATS message
pub type NatsReplies = Box<dyn Fn(&NatsMessage) -> Vec<NatsMessage> + Send + Sync>;

/// Shared state behind [`TaskConnection`]
#[derive(Default)]
pub struct TaskState {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<NatsMessage>>>,
    replies: Mutex<Option<NatsReplies>>,
    requests: Mutex<Option<mpsc::UnboundedSender<NatsMessage>>>,
    held: Mutex<HashSet<String>>,
    /// Lets one held unsubscribe proceed
    pub release: Notify,
}

impl TaskState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every publish with `respond`, delivered through the inboxes
    pub fn set_replies<F>(&self, respond: F)
    where
        F: Fn(&NatsMessage) -> Vec<NatsMessage> + Send + Sync + 'static,
    {
        *self.replies.lock().unwrap() = Some(Box::new(respond));
    }

    /// Forward every published message to the returned receiver
    pub fn forward_requests(&self) -> mpsc::UnboundedReceiver<NatsMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.requests.lock().unwrap() = Some(tx);
        rx
    }

    /// Make unsubscribe of `subject` wait for [`TaskState::release`]
    pub fn hold_unsubscribe(&self, subject: &str) {
        self.held.lock().unwrap().insert(subject.to_string());
    }

    /// Queue `message` for the subscription on its subject
    pub fn deliver(&self, message: NatsMessage) -> bool {
        let inbox = self.inboxes.lock().unwrap().get(&message.subject).cloned();
        match inbox {
            Some(inbox) => inbox.send(message).is_ok(),
            None => false,
        }
    }

    pub fn subscribed(&self, subject: &str) -> bool {
        self.inboxes.lock().unwrap().contains_key(subject)
    }
}

/// Fake session with one delivery task per subscription
pub struct TaskConnection(pub Arc<TaskState>);

#[async_trait]
impl Connection for TaskConnection {
    async fn publish_msg(&self, message: NatsMessage) -> BusResult<()> {
        let forward = self.0.requests.lock().unwrap().clone();
        if let Some(forward) = forward {
            let _ = forward.send(message.clone());
        }
        let replies = self
            .0
            .replies
            .lock()
            .unwrap()
            .as_ref()
            .map(|respond| respond(&message))
            .unwrap_or_default();
        for reply in replies {
            self.0.deliver(reply);
        }
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        _queue: &str,
        callback: MessageCallback,
    ) -> BusResult<Box<dyn NativeSubscription>> {
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
        let (stop_tx, mut stop) = oneshot::channel::<()>();
        let (done_tx, done) = oneshot::channel();
        self.0
            .inboxes
            .lock()
            .unwrap()
            .insert(subject.to_string(), inbox_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    next = inbox.recv() => match next {
                        Some(message) => callback(message).await,
                        None => break,
                    },
                }
            }
            let _ = done_tx.send(());
        });

        Ok(Box::new(TaskSubscription {
            state: self.0.clone(),
            subject: subject.to_string(),
            stop: Some(stop_tx),
            done: Some(done),
        }))
    }

    async fn ack(&self, _reply: &str, _wait_for_confirm: bool) -> BusResult<()> {
        Ok(())
    }

    async fn drain(&self) -> BusResult<()> {
        self.0.inboxes.lock().unwrap().clear();
        Ok(())
    }
}

struct TaskSubscription {
    state: Arc<TaskState>,
    subject: String,
    stop: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl NativeSubscription for TaskSubscription {
    async fn unsubscribe(&mut self) -> BusResult<()> {
        let held = self.state.held.lock().unwrap().contains(&self.subject);
        if held {
            self.state.release.notified().await;
        }
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(done) = self.done.take() {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, done).await.is_err() {
                return Err(BusError::Transport(format!(
                    "delivery task for '{}' did not stop",
                    self.subject
                )));
            }
        }
        self.state.inboxes.lock().unwrap().remove(&self.subject);
        Ok(())
    }
}

/// Connected NATS client over a [`TaskConnection`]
pub async fn connected_task_client(options: NatsOptions) -> (NatsBusClient, Arc<TaskState>) {
    let state = TaskState::new();
    let session = state.clone();
    let connect_fn: ConnectFn = Arc::new(move |_options: NatsOptions| {
        let state = session.clone();
        async move { Ok(Arc::new(TaskConnection(state)) as Arc<dyn Connection>) }.boxed()
    });
    let client = NatsBusClient::new(options, Some(connect_fn));
    client.connect().await.unwrap();
    (client, state)
}
