//! Error types for Switchboard.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwitchboardError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported message type '{kind}' (message {id})")]
    UnsupportedType { id: String, kind: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Request '{kind}' timed out after {elapsed:?}")]
    Timeout { kind: String, elapsed: Duration },

    #[error("Connection closed while awaiting a reply")]
    ConnectionClosed,

    #[error("A request with correlation key '{0}' is already pending")]
    DuplicateCorrelation(String),

    #[error("Delegation to '{target}' failed: {message}")]
    Delegation { target: String, message: String },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SwitchboardError {
    /// Stable machine-readable code carried in `error` envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::UnsupportedType { .. } => "UNSUPPORTED_TYPE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::DuplicateCorrelation(_) => "DUPLICATE_CORRELATION",
            Self::Delegation { .. } => "DELEGATION_FAILED",
            Self::Registry(_) => "REGISTRY_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;
