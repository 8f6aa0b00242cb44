use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use jobline_core::{ChannelError, LiveConnection, LiveConnector};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, trace};
use url::Url;

/// Opens WebSocket connections for the live update channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LiveConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn LiveConnection>, ChannelError> {
        debug!(%url, "opening websocket");
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        trace!(status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsConnection { stream }))
    }
}

/// One client WebSocket. Text and UTF-8 binary frames are surfaced; control
/// frames are handled by tungstenite.
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl LiveConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| ChannelError::Send(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(ChannelError::Receive(err.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("ignoring non-utf8 binary frame"),
                },
                Message::Close(frame) => {
                    debug!(?frame, "websocket closed by peer");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(err) = self.stream.close(Some(frame)).await {
            debug!(error = %err, "websocket close failed");
        }
    }
}
