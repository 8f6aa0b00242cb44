use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for caller handling and retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The call never reached the server, or no response came back.
    Network,
    /// Server answered with request-timeout (408).
    Timeout,
    /// Authentication/authorization failure.
    Auth,
    /// Rate-limited by the engine.
    RateLimited,
    /// Resource does not exist.
    NotFound,
    /// Any other client-side (4xx) rejection.
    Client,
    /// Server-side (5xx) failure.
    Server,
    /// A response or message could not be decoded.
    Parse,
    /// Client bug or invariant break.
    Internal,
}

/// Stable error payload surfaced by the request dispatcher.
///
/// Cloneable so that every caller joined onto one coalesced request observes
/// the identical failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ApiError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status code; `None` means the failure happened below HTTP.
    pub status: Option<u16>,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    /// Construct a new error without a status.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            status: None,
            retry_after_ms: None,
        }
    }

    /// Transport-level failure: the request never produced a response.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, "network_error", message)
    }

    /// Structured failure reported by the server with a non-success status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(classify_http_status(status), "http_error", message)
        }
    }

    /// Payload could not be decoded.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Parse, "parse_error", message)
    }

    /// Failure inside the client itself, with a caller-chosen code.
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message)
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Whether the failure happened before any HTTP response was received.
    pub fn is_network(&self) -> bool {
        self.category == ErrorCategory::Network && self.status.is_none()
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        404 | 410 => ErrorCategory::NotFound,
        408 => ErrorCategory::Timeout,
        429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Client,
        500..=599 => ErrorCategory::Server,
        _ => ErrorCategory::Internal,
    }
}

/// Failures of the live update channel.
///
/// These never reach application code directly; they drive reconnection and
/// surface only as connection state changes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("failed to open live connection: {0}")]
    Connect(String),
    #[error("failed to send on live connection: {0}")]
    Send(String),
    #[error("live connection receive failed: {0}")]
    Receive(String),
    #[error("live connection closed")]
    Closed,
    #[error("live channel is not connected")]
    NotConnected,
    #[error("invalid live channel url: {0}")]
    InvalidUrl(String),
}

/// Error type returned by application event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
