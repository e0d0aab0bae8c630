// Copyright (c) 2025 - Cowboy AI, Inc.
//! Error types for message bus operations

use std::fmt;

use thiserror::Error;

/// Errors that can occur in message bus operations
#[derive(Debug, Error)]
pub enum BusError {
    /// Bad or missing broker address, unrecognized backend type, bad option value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport-level connect failure or missing connect function
    #[error("Connection error: {0}")]
    Connection(String),

    /// `connect` was called on a client that already holds a session
    #[error("Client is already connected")]
    AlreadyConnected,

    /// Operation attempted before `connect` succeeded or after `disconnect`
    #[error("Client is not connected")]
    NotConnected,

    /// Publish, subscribe or unsubscribe failure, tagged with the operation name
    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },

    /// Transport failure reported asynchronously while waiting on a subscription
    #[error("Transport error: {0}")]
    Transport(String),

    /// A request did not receive its response before the deadline
    #[error("Timed out waiting for response on topic '{topic}'")]
    Timeout { topic: String },

    /// Multiple failures collected from a multi-topic operation
    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<BusError>),

    /// Operation not provided by the selected backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Backend is known but was not registered for this process
    #[error("Message bus type '{0}' is not enabled")]
    NotEnabled(String),

    /// The message bus has been switched off for this process
    #[error("Message bus is disabled")]
    Disabled,

    /// Marshalled envelope exceeds the caller's size limit
    #[error("Payload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Result type for message bus operations
pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// Wrap a failure with the name of the operation that produced it
    pub fn operation(operation: &'static str, message: impl fmt::Display) -> Self {
        BusError::Operation {
            operation,
            message: message.to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        BusError::Configuration(message.into())
    }

    /// Create a connection error
    pub fn connection(message: impl fmt::Display) -> Self {
        BusError::Connection(message.to_string())
    }

    /// True when the error is a request deadline, never a transport failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }

    /// True when the error came from the broker connection rather than the caller
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BusError::Transport(_) | BusError::Connection(_) | BusError::Operation { .. }
        )
    }

    /// Collapse a list of failures: none is success, one is returned as-is
    pub fn aggregate(mut errors: Vec<BusError>) -> BusResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(BusError::Aggregate(errors)),
        }
    }
}

struct AggregateDisplay<'a>(&'a [BusError]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for err in self.0 {
            write!(f, " [{}]", err)?;
        }
        Ok(())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}
