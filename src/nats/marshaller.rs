// Copyright (c) 2025 - Cowboy AI, Inc.
//! Envelope encoding for NATS messages
//!
//! Two wire formats are available:
//!
//! - **nats** (default): envelope metadata travels in NATS headers and the
//!   message body is the raw payload, so consumers that only care about the
//!   payload can read it without decoding anything.
//! - **json**: the whole envelope is the JSON body, with the payload base64
//!   encoded. Use this when peers cannot read headers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::envelope::{content_type, MessageEnvelope};
use crate::errors::{BusError, BusResult};
use crate::topics::subject_to_topic;

use super::connection::NatsMessage;

pub const HEADER_API_VERSION: &str = "ApiVersion";
pub const HEADER_REQUEST_ID: &str = "RequestID";
pub const HEADER_CORRELATION_ID: &str = "CorrelationID";
pub const HEADER_CONTENT_TYPE: &str = "ContentType";
pub const HEADER_ERROR_CODE: &str = "ErrorCode";
pub const HEADER_QUERY_PARAMS: &str = "QueryParams";

/// Every header the native format reads back
pub const HEADER_KEYS: &[&str] = &[
    HEADER_API_VERSION,
    HEADER_REQUEST_ID,
    HEADER_CORRELATION_ID,
    HEADER_CONTENT_TYPE,
    HEADER_ERROR_CODE,
    HEADER_QUERY_PARAMS,
];

/// Wire format selected by the `Format` option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Metadata in headers, raw payload body
    #[default]
    Native,
    /// Entire envelope as a JSON body
    Json,
}

impl FromStr for WireFormat {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "nats" | "native" => Ok(WireFormat::Native),
            "json" => Ok(WireFormat::Json),
            other => Err(BusError::configuration(format!(
                "unknown message format '{}', expected 'nats' or 'json'",
                other
            ))),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Native => write!(f, "nats"),
            WireFormat::Json => write!(f, "json"),
        }
    }
}

/// Converts envelopes to and from NATS messages
pub trait Marshaller: Send + Sync {
    fn marshal(&self, envelope: &MessageEnvelope, subject: &str) -> BusResult<NatsMessage>;

    /// Decode an inbound message; `received_topic` is set from its subject
    fn unmarshal(&self, message: &NatsMessage) -> BusResult<MessageEnvelope>;
}

/// Build the marshaller for a wire format
pub fn marshaller_for(format: WireFormat) -> Box<dyn Marshaller> {
    match format {
        WireFormat::Native => Box::new(NativeMarshaller),
        WireFormat::Json => Box::new(JsonMarshaller),
    }
}

/// Whole envelope as a JSON body
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn marshal(&self, envelope: &MessageEnvelope, subject: &str) -> BusResult<NatsMessage> {
        let body = serde_json::to_vec(envelope)?;
        Ok(NatsMessage::new(subject, body))
    }

    fn unmarshal(&self, message: &NatsMessage) -> BusResult<MessageEnvelope> {
        let mut envelope: MessageEnvelope = serde_json::from_slice(&message.payload)
            .map_err(|e| {
                BusError::Deserialization(format!(
                    "unable to decode JSON envelope from '{}': {}",
                    message.subject, e
                ))
            })?;
        envelope.received_topic = subject_to_topic(&message.subject);
        Ok(envelope)
    }
}

/// Metadata in headers, payload as the raw body
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeMarshaller;

impl Marshaller for NativeMarshaller {
    fn marshal(&self, envelope: &MessageEnvelope, subject: &str) -> BusResult<NatsMessage> {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_API_VERSION.to_string(), envelope.api_version.clone());
        headers.insert(HEADER_REQUEST_ID.to_string(), envelope.request_id.clone());
        headers.insert(HEADER_CORRELATION_ID.to_string(), envelope.correlation_id.clone());
        headers.insert(HEADER_CONTENT_TYPE.to_string(), envelope.content_type.clone());
        headers.insert(HEADER_ERROR_CODE.to_string(), envelope.error_code.to_string());
        if !envelope.query_params.is_empty() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(envelope.query_params.iter())
                .finish();
            headers.insert(HEADER_QUERY_PARAMS.to_string(), encoded);
        }
        headers.retain(|_, v| !v.is_empty());

        let mut message = NatsMessage::new(subject, envelope.payload.clone());
        message.headers = headers;
        Ok(message)
    }

    fn unmarshal(&self, message: &NatsMessage) -> BusResult<MessageEnvelope> {
        let header = |key: &str| message.headers.get(key).cloned().unwrap_or_default();

        let error_code = match message.headers.get(HEADER_ERROR_CODE) {
            None => 0,
            Some(raw) => raw.trim().parse::<i32>().map_err(|e| {
                BusError::Deserialization(format!(
                    "invalid {} header '{}' on '{}': {}",
                    HEADER_ERROR_CODE, raw, message.subject, e
                ))
            })?,
        };

        let query_params = message
            .headers
            .get(HEADER_QUERY_PARAMS)
            .map(|raw| {
                url::form_urlencoded::parse(raw.as_bytes())
                    .into_owned()
                    .collect::<BTreeMap<String, String>>()
            })
            .unwrap_or_default();

        let mut content = header(HEADER_CONTENT_TYPE);
        if content.is_empty() {
            content = content_type::JSON.to_string();
        }

        Ok(MessageEnvelope {
            api_version: header(HEADER_API_VERSION),
            received_topic: subject_to_topic(&message.subject),
            correlation_id: header(HEADER_CORRELATION_ID),
            request_id: header(HEADER_REQUEST_ID),
            error_code,
            payload: message.payload.clone(),
            content_type: content,
            query_params,
        })
    }
}
