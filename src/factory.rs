// Copyright (c) 2025 - Cowboy AI, Inc.
//! Backend selection
//!
//! Backends are registered at startup in a [`BackendRegistry`]. A process
//! that must not talk NATS builds its factory from
//! [`BackendRegistry::without_nats`]; one that must not touch the bus at all
//! uses [`ClientFactory::disabled`]. Either way the caller gets an explicit
//! error instead of a silently missing backend.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::client::MessageClient;
use crate::config::{MessageBusConfig, TYPE_MQTT, TYPE_NATS_CORE, TYPE_NATS_JETSTREAM};
use crate::envelope::{ErrorSender, MessageEnvelope, TopicChannel};
use crate::errors::{BusError, BusResult};
use crate::mqtt::MqttBusClient;
use crate::nats::NatsBusClient;

/// Builds a client for one backend type
pub type BackendConstructor =
    Arc<dyn Fn(&MessageBusConfig) -> BusResult<Arc<dyn MessageClient>> + Send + Sync>;

/// Backend type names this crate knows how to build
const KNOWN_TYPES: &[&str] = &[TYPE_MQTT, TYPE_NATS_CORE, TYPE_NATS_JETSTREAM];

/// Lower-case backend type name to constructor
#[derive(Clone)]
pub struct BackendRegistry {
    constructors: BTreeMap<String, BackendConstructor>,
}

impl BackendRegistry {
    /// Registry with no backends
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with MQTT only
    pub fn without_nats() -> Self {
        let mut registry = Self::default();
        registry.remove(TYPE_NATS_CORE);
        registry.remove(TYPE_NATS_JETSTREAM);
        registry
    }

    /// Add or replace the constructor for `bus_type`
    pub fn register(&mut self, bus_type: &str, constructor: BackendConstructor) -> &mut Self {
        self.constructors
            .insert(bus_type.trim().to_lowercase(), constructor);
        self
    }

    pub fn remove(&mut self, bus_type: &str) -> &mut Self {
        self.constructors.remove(&bus_type.trim().to_lowercase());
        self
    }

    pub fn contains(&self, bus_type: &str) -> bool {
        self.constructors
            .contains_key(&bus_type.trim().to_lowercase())
    }

    /// Registered type names in sorted order
    pub fn types(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    fn get(&self, bus_type: &str) -> Option<&BackendConstructor> {
        self.constructors.get(bus_type)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(
                TYPE_MQTT,
                Arc::new(|config: &MessageBusConfig| {
                    Ok(Arc::new(MqttBusClient::from_config(config)?) as Arc<dyn MessageClient>)
                }),
            )
            .register(
                TYPE_NATS_CORE,
                Arc::new(|config: &MessageBusConfig| {
                    Ok(Arc::new(NatsBusClient::core(config)?) as Arc<dyn MessageClient>)
                }),
            )
            .register(
                TYPE_NATS_JETSTREAM,
                Arc::new(|config: &MessageBusConfig| {
                    Ok(Arc::new(NatsBusClient::jetstream(config)?) as Arc<dyn MessageClient>)
                }),
            );
        registry
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Creates message clients from configuration
#[derive(Debug, Clone)]
pub struct ClientFactory {
    registry: BackendRegistry,
    enabled: bool,
}

impl ClientFactory {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            enabled: true,
        }
    }

    /// Factory whose clients refuse every operation
    pub fn disabled() -> Self {
        Self {
            registry: BackendRegistry::empty(),
            enabled: false,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Build the client selected by `config.Type`
    ///
    /// # Errors
    ///
    /// - [`BusError::Configuration`] for a missing host or port or an
    ///   unrecognized type
    /// - [`BusError::NotEnabled`] for a known type that was not registered
    pub fn create(&self, config: &MessageBusConfig) -> BusResult<Arc<dyn MessageClient>> {
        if !self.enabled {
            info!("Message bus is disabled, returning inert client");
            return Ok(Arc::new(DisabledClient));
        }

        config.validate()?;
        let bus_type = config.normalized_type();

        match self.registry.get(&bus_type) {
            Some(constructor) => {
                let client = constructor(config)?;
                info!(
                    bus_type = %bus_type,
                    broker = %config.broker.url(),
                    "Created message bus client"
                );
                Ok(client)
            }
            None if KNOWN_TYPES.contains(&bus_type.as_str()) => {
                Err(BusError::NotEnabled(bus_type))
            }
            None => Err(BusError::configuration(format!(
                "unknown message bus type '{}', expected one of {}",
                config.bus_type,
                KNOWN_TYPES.join(", ")
            ))),
        }
    }
}

impl Default for ClientFactory {
    fn default() -> Self {
        Self::new(BackendRegistry::default())
    }
}

/// Create a client with every built-in backend available
pub fn new_message_client(config: &MessageBusConfig) -> BusResult<Arc<dyn MessageClient>> {
    ClientFactory::default().create(config)
}

/// Stand-in client for processes with the bus switched off
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledClient;

#[async_trait]
impl MessageClient for DisabledClient {
    async fn connect(&self) -> BusResult<()> {
        Err(BusError::Disabled)
    }

    async fn publish(&self, _envelope: MessageEnvelope, _topic: &str) -> BusResult<()> {
        Err(BusError::Disabled)
    }

    async fn publish_with_size_limit(
        &self,
        _envelope: MessageEnvelope,
        _topic: &str,
        _limit_kb: u64,
    ) -> BusResult<()> {
        Err(BusError::Disabled)
    }

    async fn subscribe(&self, _topics: Vec<TopicChannel>, _errors: ErrorSender) -> BusResult<()> {
        Err(BusError::Disabled)
    }

    async fn unsubscribe(&self, _topics: &[String]) -> BusResult<()> {
        Err(BusError::Disabled)
    }

    async fn disconnect(&self) -> BusResult<()> {
        Err(BusError::Disabled)
    }

    async fn request(
        &self,
        _envelope: MessageEnvelope,
        _request_topic: &str,
        _response_topic_prefix: &str,
        _timeout: std::time::Duration,
    ) -> BusResult<MessageEnvelope> {
        Err(BusError::Disabled)
    }

    async fn publish_binary_data(&self, _data: bytes::Bytes, _topic: &str) -> BusResult<()> {
        Err(BusError::Disabled)
    }

    async fn subscribe_binary_data(
        &self,
        _topics: Vec<TopicChannel>,
        _errors: ErrorSender,
    ) -> BusResult<()> {
        Err(BusError::Disabled)
    }
}
