// Copyright (c) 2025 - Cowboy AI, Inc.
//! MQTT backend options

use std::time::Duration;

use rumqttc::{QoS, TlsConfiguration, Transport};

use crate::config::{MessageBusConfig, TlsOptions};
use crate::errors::{BusError, BusResult};

/// Option keys recognized by the MQTT backend
pub mod keys {
    pub const CLIENT_ID: &str = "ClientId";
    pub const USERNAME: &str = "Username";
    pub const PASSWORD: &str = "Password";
    pub const QOS: &str = "Qos";
    pub const KEEP_ALIVE: &str = "KeepAlive";
    pub const RETAINED: &str = "Retained";
    pub const AUTO_RECONNECT: &str = "AutoReconnect";
    pub const CLEAN_SESSION: &str = "CleanSession";
    pub const CONNECT_TIMEOUT: &str = "ConnectTimeout";
    pub const CAPACITY_HINT: &str = "CapacityHint";
}

/// Smallest keep-alive the MQTT client accepts
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Options for [`super::MqttBusClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttClientOptions {
    pub host: String,
    pub port: u16,
    /// Set for `ssl`, `tls` and `mqtts` protocols or when TLS files are given
    pub use_tls: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: QoS,
    pub keep_alive: Duration,
    pub retained: bool,
    pub auto_reconnect: bool,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    /// Capacity of the request channel between client and event loop
    pub capacity_hint: usize,
    pub tls: TlsOptions,
}

impl MqttClientOptions {
    pub fn from_config(config: &MessageBusConfig) -> BusResult<Self> {
        config.validate()?;
        let options = config.options();

        let protocol = config.broker.protocol.trim().to_lowercase();
        let use_tls = match protocol.as_str() {
            "" | "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => {
                return Err(BusError::configuration(format!(
                    "unsupported MQTT protocol '{}'",
                    other
                )))
            }
        };

        let broker_url = config.broker.url();
        let parsed = url::Url::parse(&broker_url).map_err(|e| {
            BusError::configuration(format!("invalid MQTT broker URL '{}': {}", broker_url, e))
        })?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                BusError::configuration(format!("MQTT broker URL '{}' has no host", broker_url))
            })?
            .to_string();

        let qos = match options.number::<u8>(keys::QOS, 0)? {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            level => {
                return Err(BusError::configuration(format!(
                    "invalid value '{}' for option 'Qos': expected 0, 1 or 2",
                    level
                )))
            }
        };

        let keep_alive = Duration::from_secs(options.number(keys::KEEP_ALIVE, 60u64)?);
        if keep_alive < MIN_KEEP_ALIVE {
            return Err(BusError::configuration(format!(
                "KeepAlive must be at least {} seconds",
                MIN_KEEP_ALIVE.as_secs()
            )));
        }

        let capacity_hint: usize = options.number(keys::CAPACITY_HINT, 16)?;
        if capacity_hint == 0 {
            return Err(BusError::configuration("CapacityHint must be positive"));
        }

        let tls = TlsOptions::from_options(&options)?;

        Ok(Self {
            host,
            port: config.broker.port,
            use_tls: use_tls || tls.is_configured(),
            client_id: options
                .optional_string(keys::CLIENT_ID)
                .unwrap_or_else(|| format!("cim-{}", uuid::Uuid::new_v4())),
            username: options.optional_string(keys::USERNAME),
            password: options.optional_string(keys::PASSWORD),
            qos,
            keep_alive,
            retained: options.bool(keys::RETAINED, false)?,
            auto_reconnect: options.bool(keys::AUTO_RECONNECT, false)?,
            clean_session: options.bool(keys::CLEAN_SESSION, true)?,
            connect_timeout: options.duration(keys::CONNECT_TIMEOUT, Duration::from_secs(5))?,
            capacity_hint,
            tls,
        })
    }

    /// Build the rumqttc options, reading TLS files when configured
    pub async fn to_mqtt_options(&self) -> BusResult<rumqttc::MqttOptions> {
        let mut mqtt = rumqttc::MqttOptions::new(&self.client_id, &self.host, self.port);
        mqtt.set_keep_alive(self.keep_alive)
            .set_clean_session(self.clean_session);

        if let Some(username) = &self.username {
            mqtt.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        if self.use_tls {
            mqtt.set_transport(self.transport().await?);
        }
        Ok(mqtt)
    }

    async fn transport(&self) -> BusResult<Transport> {
        if self.tls.skip_cert_verify {
            tracing::warn!("SkipCertVerify is not supported by the MQTT backend and is ignored");
        }

        let Some(ca_file) = &self.tls.ca_file else {
            return Ok(Transport::Tls(TlsConfiguration::default()));
        };

        let ca = read_pem(ca_file).await?;
        let client_auth = match (&self.tls.cert_file, &self.tls.key_file) {
            (Some(cert), Some(key)) => Some((read_pem(cert).await?, read_pem(key).await?)),
            _ => None,
        };
        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }))
    }
}

async fn read_pem(path: &str) -> BusResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| BusError::configuration(format!("unable to read '{}': {}", path, e)))
}
