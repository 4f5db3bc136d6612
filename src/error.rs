//! Error types for the RillMQ client library.

use crate::protocol::ResponseCode;

/// Main error type for RillMQ client operations.
#[derive(Debug, thiserror::Error)]
pub enum RillmqClientError {
    /// The stream is unknown to the broker, or disappeared.
    #[error("stream '{stream}' does not exist")]
    StreamDoesNotExist { stream: String },

    /// The stream exists but currently has no serving node.
    #[error("stream '{stream}' is not available")]
    StreamNotAvailable { stream: String },

    /// The broker answered with something the client cannot act on.
    #[error("illegal state: {message}")]
    IllegalState { message: String },

    /// Connection-level failure.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// An RPC did not complete in time.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The coordinator or consumer is already closed.
    #[error("closed: {message}")]
    Closed { message: String },

    /// The broker refused a subscription request.
    #[error("subscription failed: {code}")]
    Subscription { code: ResponseCode },

    /// I/O errors surfaced by the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RillmqClientError {
    pub fn stream_does_not_exist(stream: impl Into<String>) -> Self {
        Self::StreamDoesNotExist {
            stream: stream.into(),
        }
    }

    pub fn stream_not_available(stream: impl Into<String>) -> Self {
        Self::StreamNotAvailable {
            stream: stream.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    pub fn subscription(code: ResponseCode) -> Self {
        Self::Subscription { code }
    }

    /// Whether a retry may succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StreamNotAvailable { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }
}
