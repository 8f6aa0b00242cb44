//! Network adapters for `jobline-core`.
//!
//! [`HttpTransport`] implements the dispatcher's transport seam on top of
//! `reqwest`; [`WsConnector`] opens live update connections with
//! `tokio-tungstenite`.

/// HTTP transport for the request dispatcher.
pub mod http;
/// WebSocket connector for the live update channel.
pub mod ws;

pub use http::{DEFAULT_REQUEST_TIMEOUT, HttpTransport};
pub use ws::{WsConnection, WsConnector};
