// Copyright (c) 2025 - Cowboy AI, Inc.
//! Message bus configuration
//!
//! [`MessageBusConfig`] selects a backend and points it at a broker. Backend
//! tuning travels in the free-form `Optional` map and is read through
//! [`OptionMap`], which looks up each recognized key explicitly and parses
//! it into a typed value.
//!
//! ```toml
//! [MessageBus]
//! Type = "nats-jetstream"
//!
//! [MessageBus.Broker]
//! Host = "localhost"
//! Port = 4222
//! Protocol = "nats"
//!
//! [MessageBus.Optional]
//! ClientId = "core-command"
//! AutoProvision = "true"
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{BusError, BusResult};

/// Backend type name for MQTT
pub const TYPE_MQTT: &str = "mqtt";
/// Backend type name for core NATS
pub const TYPE_NATS_CORE: &str = "nats-core";
/// Backend type name for NATS JetStream
pub const TYPE_NATS_JETSTREAM: &str = "nats-jetstream";

/// Broker address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostInfo {
    pub host: String,
    pub port: u16,
    pub protocol: String,
}

impl HostInfo {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: protocol.into(),
        }
    }

    /// True when both host and port are set
    pub fn is_set(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    /// `<protocol>://<host>:<port>`
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl Default for HostInfo {
    fn default() -> Self {
        Self::new("nats", "localhost", 4222)
    }
}

/// Message bus selection and backend tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageBusConfig {
    pub broker: HostInfo,

    /// One of `mqtt`, `nats-core`, `nats-jetstream`, any letter case
    #[serde(rename = "Type")]
    pub bus_type: String,

    #[serde(default)]
    pub optional: HashMap<String, String>,
}

impl MessageBusConfig {
    pub fn new(bus_type: impl Into<String>, broker: HostInfo) -> Self {
        Self {
            broker,
            bus_type: bus_type.into(),
            optional: HashMap::new(),
        }
    }

    /// Add a backend option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.optional.insert(key.into(), value.into());
        self
    }

    /// Backend type normalized to lower case
    pub fn normalized_type(&self) -> String {
        self.bus_type.trim().to_lowercase()
    }

    /// Typed view over the `Optional` map
    pub fn options(&self) -> OptionMap<'_> {
        OptionMap::new(&self.optional)
    }

    /// Reject configurations that cannot address any broker
    pub fn validate(&self) -> BusResult<()> {
        if self.broker.host.trim().is_empty() {
            return Err(BusError::configuration("message bus broker host is not set"));
        }
        if self.broker.port == 0 {
            return Err(BusError::configuration("message bus broker port is not set"));
        }
        if self.bus_type.trim().is_empty() {
            return Err(BusError::configuration("message bus type is not set"));
        }
        Ok(())
    }

    /// Load configuration from `MESSAGEBUS_*` environment variables
    ///
    /// - `MESSAGEBUS_TYPE` (default `nats-core`)
    /// - `MESSAGEBUS_PROTOCOL` (default `nats`, or `tcp` for MQTT)
    /// - `MESSAGEBUS_HOST` (default `localhost`)
    /// - `MESSAGEBUS_PORT` (default 4222, or 1883 for MQTT)
    /// - `MESSAGEBUS_OPTIONAL` as `Key=Value,Key2=Value2`
    pub fn from_env() -> BusResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> BusResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bus_type = lookup("MESSAGEBUS_TYPE").unwrap_or_else(|| TYPE_NATS_CORE.to_string());
        let is_mqtt = bus_type.eq_ignore_ascii_case(TYPE_MQTT);

        let protocol = lookup("MESSAGEBUS_PROTOCOL")
            .unwrap_or_else(|| if is_mqtt { "tcp" } else { "nats" }.to_string());
        let host = lookup("MESSAGEBUS_HOST").unwrap_or_else(|| "localhost".to_string());
        let port = match lookup("MESSAGEBUS_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| {
                BusError::configuration(format!("invalid MESSAGEBUS_PORT '{}': {}", raw, e))
            })?,
            None if is_mqtt => 1883,
            None => 4222,
        };

        let mut config = Self::new(bus_type, HostInfo::new(protocol, host, port));
        if let Some(raw) = lookup("MESSAGEBUS_OPTIONAL") {
            config.optional = parse_option_pairs(&raw)?;
        }
        Ok(config)
    }
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self::new(TYPE_NATS_CORE, HostInfo::default())
    }
}

fn parse_option_pairs(raw: &str) -> BusResult<HashMap<String, String>> {
    let mut options = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            BusError::configuration(format!("option '{}' is not in Key=Value form", pair))
        })?;
        options.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(options)
}

/// Read-only, typed lookup over a backend option map
///
/// Keys match case-insensitively. A present but unparsable value is a
/// configuration error naming the key; an absent value yields the caller's
/// default.
#[derive(Debug, Clone, Copy)]
pub struct OptionMap<'a> {
    raw: &'a HashMap<String, String>,
}

impl<'a> OptionMap<'a> {
    pub fn new(raw: &'a HashMap<String, String>) -> Self {
        Self { raw }
    }

    /// Raw value for `key`, if present and not blank
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.raw
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn optional_string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    pub fn bool(&self, key: &str, default: bool) -> BusResult<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
            Some(v) => Err(invalid(key, v, "expected true or false")),
        }
    }

    pub fn number<T>(&self, key: &str, default: T) -> BusResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.parse::<T>().map_err(|e| invalid(key, v, e)),
        }
    }

    /// Duration given as bare seconds or with an `ms`, `s` or `m` suffix
    pub fn duration(&self, key: &str, default: Duration) -> BusResult<Duration> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => parse_duration(v).ok_or_else(|| invalid(key, v, "expected a duration")),
        }
    }
}

fn invalid(key: &str, value: &str, reason: impl std::fmt::Display) -> BusError {
    BusError::configuration(format!(
        "invalid value '{}' for option '{}': {}",
        value, key, reason
    ))
}

fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(s) = raw.strip_suffix('s') {
        return s.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(m) = raw.strip_suffix('m') {
        return m
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs);
    }
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

/// TLS settings shared by every backend's option set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Accept any server certificate
    pub skip_cert_verify: bool,
    /// PEM file with trusted root certificates
    pub ca_file: Option<String>,
    /// PEM file with the client certificate
    pub cert_file: Option<String>,
    /// PEM file with the client private key
    pub key_file: Option<String>,
}

impl TlsOptions {
    pub const SKIP_CERT_VERIFY: &'static str = "SkipCertVerify";
    pub const CA_FILE: &'static str = "CaFile";
    pub const CERT_FILE: &'static str = "CertFile";
    pub const KEY_FILE: &'static str = "KeyFile";

    pub fn from_options(options: &OptionMap<'_>) -> BusResult<Self> {
        let tls = Self {
            skip_cert_verify: options.bool(Self::SKIP_CERT_VERIFY, false)?,
            ca_file: options.optional_string(Self::CA_FILE),
            cert_file: options.optional_string(Self::CERT_FILE),
            key_file: options.optional_string(Self::KEY_FILE),
        };
        if tls.cert_file.is_some() != tls.key_file.is_some() {
            return Err(BusError::configuration(
                "CertFile and KeyFile must be configured together",
            ));
        }
        Ok(tls)
    }

    /// True when any TLS setting was supplied
    pub fn is_configured(&self) -> bool {
        self.ca_file.is_some() || self.cert_file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_option_lookup_ignores_key_case() {
        let raw = options(&[("clientid", "svc-1"), ("QOS", "1")]);
        let map = OptionMap::new(&raw);
        assert_eq!(map.string("ClientId", "x"), "svc-1");
        assert_eq!(map.number::<u8>("Qos", 0).unwrap(), 1);
    }

    #[test]
    fn test_option_defaults_apply_when_absent_or_blank() {
        let raw = options(&[("KeepAlive", "  ")]);
        let map = OptionMap::new(&raw);
        assert_eq!(map.number::<u64>("KeepAlive", 60).unwrap(), 60);
        assert!(!map.bool("Retained", false).unwrap());
    }

    #[test]
    fn test_invalid_option_names_the_key() {
        let raw = options(&[("AutoReconnect", "maybe")]);
        let err = OptionMap::new(&raw).bool("AutoReconnect", false).unwrap_err();
        assert!(matches!(err, BusError::Configuration(_)));
        assert!(err.to_string().contains("AutoReconnect"));
    }

    #[test_case("5" => Some(Duration::from_secs(5)))]
    #[test_case("5s" => Some(Duration::from_secs(5)))]
    #[test_case("250ms" => Some(Duration::from_millis(250)))]
    #[test_case("2m" => Some(Duration::from_secs(120)))]
    #[test_case("soon" => None)]
    #[test_case("999999999999999999m" => None; "minutes overflow")]
    fn test_parse_duration(raw: &str) -> Option<Duration> {
        parse_duration(raw)
    }

    #[test]
    fn test_overflowing_duration_is_configuration_error() {
        let raw = options(&[("ConnectTimeout", "999999999999999999m")]);
        let err = OptionMap::new(&raw)
            .duration("ConnectTimeout", Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, BusError::Configuration(_)));
    }

    #[test]
    fn test_validate_requires_host_and_port() {
        let mut config = MessageBusConfig::new("mqtt", HostInfo::new("tcp", "", 1883));
        assert!(matches!(config.validate(), Err(BusError::Configuration(_))));

        config.broker.host = "broker".to_string();
        config.broker.port = 0;
        assert!(matches!(config.validate(), Err(BusError::Configuration(_))));

        config.broker.port = 1883;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = MessageBusConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, MessageBusConfig::default());
        assert_eq!(config.broker.url(), "nats://localhost:4222");
    }

    #[test]
    fn test_from_lookup_mqtt() {
        let env = options(&[
            ("MESSAGEBUS_TYPE", "MQTT"),
            ("MESSAGEBUS_HOST", "broker.local"),
            ("MESSAGEBUS_OPTIONAL", "ClientId=svc, Qos=1"),
        ]);
        let config = MessageBusConfig::from_lookup(|k| env.get(k).cloned()).unwrap();

        assert_eq!(config.normalized_type(), TYPE_MQTT);
        assert_eq!(config.broker.url(), "tcp://broker.local:1883");
        assert_eq!(config.optional.get("ClientId").map(String::as_str), Some("svc"));
        assert_eq!(config.optional.get("Qos").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_from_lookup_rejects_bad_port() {
        let err = MessageBusConfig::from_lookup(|k| {
            (k == "MESSAGEBUS_PORT").then(|| "http".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, BusError::Configuration(_)));
    }

    #[test]
    fn test_deserialize_pascal_case() {
        let config: MessageBusConfig = serde_json::from_str(
            r#"{
                "Broker": { "Host": "localhost", "Port": 4222, "Protocol": "nats" },
                "Type": "nats-jetstream",
                "Optional": { "AutoProvision": "true" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.normalized_type(), TYPE_NATS_JETSTREAM);
        assert!(config.options().bool("AutoProvision", false).unwrap());
    }

    #[test]
    fn test_tls_requires_cert_and_key_together() {
        let raw = options(&[("CertFile", "client.pem")]);
        assert!(TlsOptions::from_options(&OptionMap::new(&raw)).is_err());

        let raw = options(&[("CertFile", "client.pem"), ("KeyFile", "client.key")]);
        let tls = TlsOptions::from_options(&OptionMap::new(&raw)).unwrap();
        assert!(tls.is_configured());
    }
}
