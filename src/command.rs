// Copyright (c) 2025 - Cowboy AI, Inc.
//! Device command client
//!
//! Issues device commands to the core-command service over the message bus
//! and waits for its reply. Uses only the public [`MessageClient`] surface.
//!
//! # Topic Layout
//!
//! ```text
//! <base>/core-command/request/<device>/<command>/get     read a command
//! <base>/core-command/request/<device>/<command>/set     write settings
//! <base>/core-command/request/query/<device>             list a device's commands
//! <base>/core-command/request/query/all                  list every device's commands
//! <prefix>/<request id>                                  reply
//! ```
//!
//! Behavioral flags such as `ds-pushevent` travel as envelope query
//! parameters, never as extra topic levels.
//!
//! # Failures
//!
//! A reply with a non-zero `ErrorCode` is an application failure reported by
//! the command service ([`CommandError::Application`]). A missing reply or a
//! broken transport is a bus failure ([`CommandError::Bus`]).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::client::MessageClient;
use crate::envelope::{content_type, MessageEnvelope};
use crate::errors::BusError;
use crate::topics::TopicBuilder;

pub const QUERY_PUSH_EVENT: &str = "ds-pushevent";
pub const QUERY_RETURN_EVENT: &str = "ds-returnevent";
pub const QUERY_OFFSET: &str = "offset";
pub const QUERY_LIMIT: &str = "limit";

const CORE_COMMAND: &str = "core-command";
const ALL_DEVICES: &str = "all";

/// Command client result type
pub type CommandResult<T> = Result<T, CommandError>;

/// Command client errors
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command service answered with a failure
    #[error("Command failed with code {code}: {message}")]
    Application { code: i32, message: String },

    /// The request never produced a reply
    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    /// The reply payload could not be decoded
    #[error("Invalid response payload: {0}")]
    InvalidResponse(String),

    /// Settings could not be encoded
    #[error("Invalid settings: {0}")]
    InvalidRequest(String),
}

/// Topic and timing settings for [`CommandClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandClientConfig {
    pub base_topic: String,
    /// Defaults to `<base>/response/core-command` when empty
    pub response_topic_prefix: String,
    pub timeout: Duration,
    /// Percent-escape device and command names in topics
    pub escape_names: bool,
}

impl CommandClientConfig {
    pub fn new(base_topic: impl Into<String>) -> Self {
        Self {
            base_topic: base_topic.into(),
            ..Self::default()
        }
    }

    /// Reply prefix, derived from the base topic when not configured
    pub fn response_prefix(&self) -> String {
        if self.response_topic_prefix.is_empty() {
            TopicBuilder::new(&self.base_topic)
                .segment("response")
                .segment(CORE_COMMAND)
                .build()
        } else {
            self.response_topic_prefix.clone()
        }
    }
}

impl Default for CommandClientConfig {
    fn default() -> Self {
        Self {
            base_topic: "cim".to_string(),
            response_topic_prefix: String::new(),
            timeout: Duration::from_secs(10),
            escape_names: false,
        }
    }
}

/// Issues device commands and waits for replies
#[derive(Clone)]
pub struct CommandClient {
    client: Arc<dyn MessageClient>,
    config: CommandClientConfig,
}

impl CommandClient {
    pub fn new(client: Arc<dyn MessageClient>, config: CommandClientConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &CommandClientConfig {
        &self.config
    }

    fn request_topic(&self) -> TopicBuilder {
        TopicBuilder::new(&self.config.base_topic)
            .escape_names(self.config.escape_names)
            .segment(CORE_COMMAND)
            .segment("request")
    }

    /// Topic for a get or set on one device command
    pub fn command_topic(&self, device: &str, command: &str, method: CommandMethod) -> String {
        self.request_topic()
            .escaped(device)
            .escaped(command)
            .segment(method.as_str())
            .build()
    }

    /// Topic for a command listing; `None` lists every device
    pub fn query_topic(&self, device: Option<&str>) -> String {
        let builder = self.request_topic().segment("query");
        match device {
            Some(device) => builder.escaped(device),
            None => builder.segment(ALL_DEVICES),
        }
        .build()
    }

    /// Read a command's current value
    ///
    /// Returns the event produced by the device service, or `None` when
    /// `return_event` is false and the service answered with no body.
    pub async fn issue_get_command(
        &self,
        device: &str,
        command: &str,
        push_event: bool,
        return_event: bool,
    ) -> CommandResult<Option<Value>> {
        let envelope = request_envelope(Vec::new())
            .with_query_param(QUERY_PUSH_EVENT, push_event.to_string())
            .with_query_param(QUERY_RETURN_EVENT, return_event.to_string());

        let topic = self.command_topic(device, command, CommandMethod::Get);
        let response = self.call(envelope, &topic).await?;
        if response.payload.is_empty() {
            return Ok(None);
        }
        decode(&response).map(Some)
    }

    /// Write settings to a device command
    pub async fn issue_set_command<S>(
        &self,
        device: &str,
        command: &str,
        settings: &S,
    ) -> CommandResult<()>
    where
        S: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(settings)
            .map_err(|e| CommandError::InvalidRequest(e.to_string()))?;
        let envelope = request_envelope(payload);

        let topic = self.command_topic(device, command, CommandMethod::Set);
        self.call(envelope, &topic).await?;
        Ok(())
    }

    /// Commands offered by one device
    pub async fn device_core_commands(&self, device: &str) -> CommandResult<Value> {
        let envelope = request_envelope(Vec::new());
        let response = self.call(envelope, &self.query_topic(Some(device))).await?;
        decode(&response)
    }

    /// Commands offered by every device, paged
    pub async fn all_device_core_commands(&self, offset: u32, limit: i32) -> CommandResult<Value> {
        let envelope = request_envelope(Vec::new())
            .with_query_param(QUERY_OFFSET, offset.to_string())
            .with_query_param(QUERY_LIMIT, limit.to_string());
        let response = self.call(envelope, &self.query_topic(None)).await?;
        decode(&response)
    }

    async fn call(&self, envelope: MessageEnvelope, topic: &str) -> CommandResult<MessageEnvelope> {
        let prefix = self.config.response_prefix();
        debug!(topic = %topic, response_prefix = %prefix, "Issuing core command");

        let response = self
            .client
            .request(envelope, topic, &prefix, self.config.timeout)
            .await?;

        if response.is_error() {
            return Err(CommandError::Application {
                code: response.error_code,
                message: response.payload_text(),
            });
        }
        Ok(response)
    }
}

/// Direction of a device command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMethod {
    Get,
    Set,
}

impl CommandMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandMethod::Get => "get",
            CommandMethod::Set => "set",
        }
    }
}

fn request_envelope(payload: Vec<u8>) -> MessageEnvelope {
    MessageEnvelope::for_request(payload, content_type::JSON, BTreeMap::new())
}

fn decode(response: &MessageEnvelope) -> CommandResult<Value> {
    serde_json::from_slice(&response.payload)
        .map_err(|e| CommandError::InvalidResponse(e.to_string()))
}
