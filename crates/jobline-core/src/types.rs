use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

/// HTTP-style method of an outbound call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Read-only calls may be cached, coalesced and retried; mutating calls never are.
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }

    /// Upper-case wire name, as used in signatures and request lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound request as handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    /// Endpoint path relative to the API base, for example `/models`.
    pub endpoint: String,
    /// Optional structured body.
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Live update channel connection state. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Event types the engine is known to push.
pub mod event_types {
    /// Liveness acknowledgement of a keepalive ping.
    pub const PONG: &str = "pong";
    pub const JOB_PROGRESS: &str = "job_progress";
    pub const JOB_STATUS: &str = "job_status";
    pub const MODEL_STATE: &str = "model_state";
}

/// Inbound push event, decoded from the `{ event, timestamp, data }` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEvent {
    #[serde(rename = "event")]
    pub event_type: String,
    pub timestamp: String,
    #[serde(rename = "data", default)]
    pub payload: Value,
}

impl InboundEvent {
    /// Decode a text frame into an event envelope.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Deserialize the event payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Messages the client sends over the live channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Keepalive: `{"type":"ping"}`.
    Ping,
    /// Application-defined JSON payload.
    Json(Value),
}

impl OutboundMessage {
    /// Wire text of the message.
    pub fn to_text(&self) -> String {
        match self {
            Self::Ping => json!({ "type": "ping" }).to_string(),
            Self::Json(value) => value.to_string(),
        }
    }
}
