// Copyright (c) 2025 - Cowboy AI, Inc.
//! Canonical message envelope
//!
//! Every publish, subscribe and request moves a [`MessageEnvelope`]. Backends
//! translate it to and from their native message representation; callers
//! never see broker-specific types.
//!
//! # JSON shape
//!
//! ```text
//! {
//!   "ApiVersion": "v3",
//!   "ReceivedTopic": "",
//!   "CorrelationID": "5f0c...",
//!   "RequestID": "8a11...",
//!   "ErrorCode": 0,
//!   "Payload": "eyJ2YWx1ZSI6IDF9",      // base64
//!   "ContentType": "application/json",
//!   "QueryParams": { "ds-pushevent": "true" }
//! }
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::BusError;

/// API version stamped on envelopes created by this crate
pub const API_VERSION: &str = "v3";

/// `ErrorCode` value meaning the responder succeeded
pub const ERROR_CODE_SUCCESS: i32 = 0;

/// `ErrorCode` value used for application-level failures
pub const ERROR_CODE_FAILURE: i32 = 1;

/// Well-known payload content types
pub mod content_type {
    pub const JSON: &str = "application/json";
    pub const CBOR: &str = "application/cbor";
    pub const TEXT: &str = "text/plain";
    pub const BINARY: &str = "application/octet-stream";
}

/// Canonical message wrapper shared by all backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageEnvelope {
    #[serde(default)]
    pub api_version: String,

    /// Topic the message arrived on; set by the receiving backend
    #[serde(default)]
    pub received_topic: String,

    #[serde(rename = "CorrelationID", default)]
    pub correlation_id: String,

    /// Identifier tying a response to its request
    #[serde(rename = "RequestID", default)]
    pub request_id: String,

    /// 0 on success, non-zero for an application-level failure
    #[serde(default)]
    pub error_code: i32,

    #[serde(with = "base64_payload", default)]
    pub payload: Bytes,

    #[serde(default)]
    pub content_type: String,

    /// Behavioral flags that travel with the message rather than in its topic
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, String>,
}

impl MessageEnvelope {
    /// Create an envelope with no identifiers
    pub fn new(payload: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            received_topic: String::new(),
            correlation_id: String::new(),
            request_id: String::new(),
            error_code: ERROR_CODE_SUCCESS,
            payload: payload.into(),
            content_type: content_type.into(),
            query_params: BTreeMap::new(),
        }
    }

    /// Create a request envelope with fresh request and correlation identifiers
    pub fn for_request(
        payload: impl Into<Bytes>,
        content_type: impl Into<String>,
        query_params: BTreeMap<String, String>,
    ) -> Self {
        let mut envelope = Self::new(payload, content_type);
        envelope.request_id = new_request_id();
        envelope.correlation_id = new_request_id();
        envelope.query_params = query_params;
        envelope
    }

    /// Create the response to `request`, preserving its identifiers
    pub fn for_response(
        request: &MessageEnvelope,
        payload: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Self {
        let mut envelope = Self::new(payload, content_type);
        envelope.request_id = request.request_id.clone();
        envelope.correlation_id = request.correlation_id.clone();
        envelope
    }

    /// Create an application-level failure response to `request`
    pub fn for_error(request: &MessageEnvelope, message: impl Into<String>) -> Self {
        let message: String = message.into();
        let mut envelope = Self::for_response(request, message, content_type::TEXT);
        envelope.error_code = ERROR_CODE_FAILURE;
        envelope
    }

    /// Attach a query parameter
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// True when the responder reported an application-level failure
    pub fn is_error(&self) -> bool {
        self.error_code != ERROR_CODE_SUCCESS
    }

    /// Decode a JSON payload into `T`
    pub fn payload_json<T>(&self) -> Result<T, BusError>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_slice(&self.payload)
            .map_err(|e| BusError::Deserialization(e.to_string()))
    }

    /// Payload as text, lossy for non-UTF-8 bytes
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl Default for MessageEnvelope {
    fn default() -> Self {
        Self::new(Bytes::new(), content_type::JSON)
    }
}

/// Generate a globally unique request identifier
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Destination for messages delivered on one subscribed topic
#[derive(Debug, Clone)]
pub struct TopicChannel {
    pub topic: String,
    pub messages: mpsc::Sender<MessageEnvelope>,
}

impl TopicChannel {
    pub fn new(topic: impl Into<String>, messages: mpsc::Sender<MessageEnvelope>) -> Self {
        Self {
            topic: topic.into(),
            messages,
        }
    }
}

/// Shared queue receiving decode and transport failures from subscriptions
pub type ErrorSender = mpsc::Sender<BusError>;

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
