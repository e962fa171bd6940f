//! Error types for the ordered streams consumer and producer.

use crate::types::{StreamName, StreamPosition, SubscribeFrom};
use thiserror::Error;

/// Main error type for stream operations.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("stream not found: {stream}")]
    NotFound { stream: StreamName },

    #[error("log store unavailable: {message}")]
    Unavailable { message: String },

    #[error("client handle closed")]
    Closed,

    #[error("failed to decode event at {stream}@{position}: {message}")]
    Decode {
        stream: StreamName,
        position: StreamPosition,
        message: String,
    },

    #[error("failed to encode event: {0}")]
    Encode(String),

    #[error("empty append not allowed")]
    EmptyAppend,

    #[error("resubscribe to {stream} ({from}) gave up after {attempts} attempts: {last_error}")]
    ResubscribeExhausted {
        stream: StreamName,
        from: SubscribeFrom,
        attempts: u32,
        last_error: Box<StreamError>,
    },

    #[error("consumer task failed: {0}")]
    TaskFailed(String),
}

impl StreamError {
    /// Create an `Unavailable` error from any message.
    pub fn unavailable(message: impl Into<String>) -> Self {
        StreamError::Unavailable {
            message: message.into(),
        }
    }

    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Unavailable { .. })
    }

    /// Whether this error means the stream has never been written.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StreamError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Encode(err.to_string())
    }
}
