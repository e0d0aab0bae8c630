// Copyright (c) 2025 - Cowboy AI, Inc.
//! Tests for backend selection aligned with user stories

use bytes::Bytes;
use test_case::test_case;

use cim_messagebus::config::{TYPE_MQTT, TYPE_NATS_CORE, TYPE_NATS_JETSTREAM};
use cim_messagebus::{
    new_message_client, BackendRegistry, BusError, ClientFactory, HostInfo, MessageBusConfig,
    MessageClient, MessageEnvelope,
};

fn config(bus_type: &str) -> MessageBusConfig {
    MessageBusConfig::new(bus_type, HostInfo::new("tcp", "localhost", 1883))
}

/// User Story: F1 - Backend Selection From Configuration
///
/// As a service owner
/// I want the broker chosen by a configuration string
/// So that one build can run against MQTT or NATS
///
/// ```mermaid
/// graph LR
///     Config[MessageBusConfig.Type] --> Factory
///     Factory -->|mqtt| MQTT[MqttBusClient]
///     Factory -->|nats-core| Core[NatsBusClient core]
///     Factory -->|nats-jetstream| JS[NatsBusClient JetStream]
/// ```
///
/// Acceptance Criteria:
/// - The type matches in any letter case
/// - Missing host or port is a configuration error
/// - An unknown type is a configuration error
#[test_case("mqtt")]
#[test_case("MQTT")]
#[test_case("Mqtt")]
#[test_case("nats-core")]
#[test_case("NATS-JetStream")]
fn test_known_types_create_clients(bus_type: &str) {
    assert!(new_message_client(&config(bus_type)).is_ok());
}

#[test]
fn test_empty_host_is_configuration_error() {
    let config = MessageBusConfig::new(TYPE_MQTT, HostInfo::new("tcp", "", 1883));
    assert!(matches!(
        new_message_client(&config),
        Err(BusError::Configuration(_))
    ));
}

#[test]
fn test_zero_port_is_configuration_error() {
    let config = MessageBusConfig::new(TYPE_NATS_CORE, HostInfo::new("nats", "localhost", 0));
    assert!(matches!(
        new_message_client(&config),
        Err(BusError::Configuration(_))
    ));
}

#[test_case("kafka")]
#[test_case("")]
#[test_case("redis-streams")]
fn test_unknown_type_is_configuration_error(bus_type: &str) {
    assert!(matches!(
        new_message_client(&config(bus_type)),
        Err(BusError::Configuration(_))
    ));
}

#[test]
fn test_bad_backend_option_surfaces_at_creation() {
    let config = config(TYPE_MQTT).with_option("Qos", "7");
    assert!(matches!(
        new_message_client(&config),
        Err(BusError::Configuration(_))
    ));
}

/// User Story: F2 - Builds Without NATS
///
/// As a deployer of an MQTT-only edge service
/// I want NATS backends absent from the registry
/// So that asking for them fails loudly instead of silently
#[test_case(TYPE_NATS_CORE)]
#[test_case(TYPE_NATS_JETSTREAM)]
fn test_unregistered_nats_is_not_enabled(bus_type: &str) {
    let factory = ClientFactory::new(BackendRegistry::without_nats());

    match factory.create(&config(bus_type)) {
        Err(BusError::NotEnabled(name)) => assert_eq!(name, bus_type),
        Err(other) => panic!("expected NotEnabled, got {other}"),
        Ok(_) => panic!("expected NotEnabled, got a client"),
    }
}

#[test]
fn test_without_nats_still_builds_mqtt() {
    let factory = ClientFactory::new(BackendRegistry::without_nats());
    assert!(factory.create(&config(TYPE_MQTT)).is_ok());
}

/// User Story: F3 - Message Bus Switched Off
///
/// As a deployer of a standalone service
/// I want to switch the bus off entirely
/// So that every bus call fails explicitly and nothing is contacted
#[tokio::test]
async fn test_disabled_factory_returns_inert_client() {
    let client = ClientFactory::disabled()
        .create(&MessageBusConfig::default())
        .unwrap();

    assert!(matches!(client.connect().await, Err(BusError::Disabled)));
    assert!(matches!(
        client.publish(MessageEnvelope::default(), "a/b").await,
        Err(BusError::Disabled)
    ));
    assert!(matches!(
        client
            .request(
                MessageEnvelope::default(),
                "a/b",
                "a/response",
                std::time::Duration::from_millis(10)
            )
            .await,
        Err(BusError::Disabled)
    ));
    assert!(client
        .publish_binary_data(Bytes::from_static(b"x"), "a/b")
        .await
        .is_err());
}

#[tokio::test]
async fn test_nats_binary_passthrough_is_unsupported() {
    let client = new_message_client(&config(TYPE_NATS_CORE)).unwrap();
    // Not connected, but the capability check comes first.
    assert!(matches!(
        client
            .publish_binary_data(Bytes::from_static(b"x"), "a/b")
            .await,
        Err(BusError::Unsupported(_))
    ));
}
