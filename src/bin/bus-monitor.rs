// Copyright (c) 2025 - Cowboy AI, Inc.
//! Message Bus Monitor
//!
//! Subscribes to one or more topics on the configured message bus and logs
//! every envelope that arrives.
//!
//! Run with: cargo run --bin bus-monitor
//!
//! Environment:
//! - `MESSAGEBUS_TYPE`, `MESSAGEBUS_HOST`, `MESSAGEBUS_PORT`,
//!   `MESSAGEBUS_PROTOCOL`, `MESSAGEBUS_OPTIONAL` select the broker
//! - `MESSAGEBUS_MONITOR_TOPICS` comma-separated topic filters (default `#`)
//! - `RUST_LOG` adjusts verbosity

use anyhow::{Context, Result};
use cim_messagebus::{new_message_client, MessageBusConfig, TopicChannel};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Queue depth per monitored topic
const QUEUE_CAPACITY: usize = 64;

/// Configuration for the monitor
#[derive(Debug, Clone)]
struct MonitorConfig {
    bus: MessageBusConfig,
    topics: Vec<String>,
}

impl MonitorConfig {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let bus = MessageBusConfig::from_env().context("Invalid message bus configuration")?;

        let topics: Vec<String> = std::env::var("MESSAGEBUS_MONITOR_TOPICS")
            .unwrap_or_else(|_| "#".to_string())
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if topics.is_empty() {
            anyhow::bail!("MESSAGEBUS_MONITOR_TOPICS names no topics");
        }

        Ok(Self { bus, topics })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("🚀 Starting message bus monitor");

    let config = MonitorConfig::from_env()?;
    info!("📋 Configuration loaded:");
    info!("  - Type: {}", config.bus.bus_type);
    info!("  - Broker: {}", config.bus.broker.url());
    info!("  - Topics: {}", config.topics.join(", "));

    let client = new_message_client(&config.bus).context("Failed to create message client")?;
    client
        .connect()
        .await
        .context("Failed to connect to message bus")?;
    info!("✅ Connected to message bus");

    let (message_tx, mut messages) = mpsc::channel(QUEUE_CAPACITY);
    let (error_tx, mut errors) = mpsc::channel(QUEUE_CAPACITY);
    let channels = config
        .topics
        .iter()
        .map(|topic| TopicChannel::new(topic.clone(), message_tx.clone()))
        .collect();
    drop(message_tx);

    client
        .subscribe(channels, error_tx)
        .await
        .context("Failed to subscribe")?;
    info!("🎧 Monitoring {} topic filter(s)", config.topics.len());

    let mut message_count = 0u64;
    let mut error_count = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown requested");
                break;
            }
            Some(envelope) = messages.recv() => {
                message_count += 1;
                info!(
                    topic = %envelope.received_topic,
                    request_id = %envelope.request_id,
                    size = envelope.payload.len(),
                    content_type = %envelope.content_type,
                    error_code = envelope.error_code,
                    "📨 Message"
                );
            }
            Some(err) = errors.recv() => {
                error_count += 1;
                error!("❌ Bus error: {} (total errors: {})", err, error_count);
            }
        }
    }

    info!(
        "📊 Statistics: {} messages received, {} errors",
        message_count, error_count
    );

    if let Err(e) = client.unsubscribe(&config.topics).await {
        warn!("⚠️ Failed to unsubscribe cleanly: {}", e);
    }
    client
        .disconnect()
        .await
        .context("Failed to disconnect from message bus")?;
    info!("👋 Disconnected");

    Ok(())
}
