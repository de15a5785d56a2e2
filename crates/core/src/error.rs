//! Error types for the decoupled streaming protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::InferResponse;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur on either side of a decoupled stream
#[derive(Debug, Error)]
pub enum Error {
    /// Endpoint unreachable, or the stream to it was lost
    #[error("Connection error ({endpoint}): {reason}")]
    Connection {
        /// Endpoint address
        endpoint: String,
        /// Failure reason
        reason: String,
    },

    /// Duplicate or malformed request, rejected before transmission
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Backend configuration does not allow decoupled serving
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Backend received a batch it cannot execute
    #[error("Unsupported batch size {0}: decoupled models execute one request at a time")]
    UnsupportedBatch(usize),

    /// Producer failed while generating chunks
    #[error("Producer failure: {0}")]
    ProducerFailure(String),

    /// Session was torn down while the request was pending
    #[error("Session {0} closed")]
    SessionClosed(String),

    /// Caller gave up waiting
    #[error("Timed out after {timeout_ms}ms waiting for: {}", .request_ids.join(", "))]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
        /// Requests that were still open
        request_ids: Vec<String>,
    },

    /// A response could not be correlated with an open request
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The response stream of a request ended with an error response
    #[error("Request {request_id} failed after {} response(s): {source}", .responses.len())]
    RequestFailed {
        /// Request that failed
        request_id: String,
        /// Error reported by the backend
        source: ResponseError,
        /// Every response received for the request, the error response last
        responses: Vec<InferResponse>,
    },

    /// Lifecycle misuse (e.g. opening a stream twice)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a connection failure
    pub fn connection(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Connection {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error ends the whole session rather than one request
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::SessionClosed(_))
    }

    /// Whether trying the same operation again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::Transport(_) | Error::Io(_) | Error::Timeout { .. }
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Category of an error carried inside a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseErrorKind {
    /// Batch of more than one request
    UnsupportedBatch,
    /// Producer failed to open or failed mid-stream
    ProducerFailure,
    /// Request rejected by the backend
    InvalidRequest,
    /// Client cancelled the request
    Cancelled,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ResponseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseErrorKind::UnsupportedBatch => write!(f, "unsupported_batch"),
            ResponseErrorKind::ProducerFailure => write!(f, "producer_failure"),
            ResponseErrorKind::InvalidRequest => write!(f, "invalid_request"),
            ResponseErrorKind::Cancelled => write!(f, "cancelled"),
            ResponseErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Error description carried by an error response
///
/// An error response is always the last response of its request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ResponseError {
    /// Error category
    pub kind: ResponseErrorKind,
    /// Human readable description
    pub message: String,
}

impl ResponseError {
    /// Create a new response error
    pub fn new(kind: ResponseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Map a backend-side error onto the response error it is reported as
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::UnsupportedBatch(_) => ResponseErrorKind::UnsupportedBatch,
            Error::ProducerFailure(_) | Error::Io(_) => ResponseErrorKind::ProducerFailure,
            Error::InvalidRequest(_) => ResponseErrorKind::InvalidRequest,
            _ => ResponseErrorKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}
