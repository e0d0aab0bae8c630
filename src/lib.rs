// Copyright (c) 2025 - Cowboy AI, Inc.
//! Message bus abstraction for the Composable Information Machine
//!
//! One client contract over three brokers (MQTT, core NATS, NATS JetStream)
//! plus synchronous request/response over publish/subscribe.
//!
//! ```text
//! CommandClient ─┐
//! services ──────┼─▶ Arc<dyn MessageClient> ─┬─▶ MqttBusClient ─▶ rumqttc
//!                │         ▲                 └─▶ NatsBusClient ─▶ async-nats
//!                │         │                         ├─ core
//!                └─ request::request                 └─ JetStream
//! ```
//!
//! Clients are created from a [`MessageBusConfig`] by a [`ClientFactory`]:
//!
//! ```no_run
//! use cim_messagebus::{new_message_client, MessageBusConfig};
//!
//! # async fn run() -> cim_messagebus::BusResult<()> {
//! let client = new_message_client(&MessageBusConfig::from_env()?)?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod command;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod factory;
pub mod mqtt;
pub mod nats;
pub mod request;
pub mod topics;

pub use client::MessageClient;
pub use command::{CommandClient, CommandClientConfig, CommandError};
pub use config::{HostInfo, MessageBusConfig, OptionMap, TlsOptions};
pub use envelope::{ErrorSender, MessageEnvelope, TopicChannel};
pub use errors::{BusError, BusResult};
pub use factory::{new_message_client, BackendRegistry, ClientFactory, DisabledClient};
pub use mqtt::MqttBusClient;
pub use nats::{NatsBusClient, NatsOptions};
pub use topics::{subject_to_topic, topic_to_subject, TopicBuilder};
