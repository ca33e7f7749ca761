//! WebSocket transport built on `tokio-tungstenite`.

use crate::error::{SyncError, SyncResult};
use crate::transport::{ConnectRequest, Connection, Connector};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

/// Header carrying the device id.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Header carrying the JSON-encoded client capabilities.
pub const CAPABILITIES_HEADER: &str = "x-client-capabilities";

/// Opens real WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Creates a new connector.
    pub fn new() -> Self {
        Self
    }
}

fn header_value(name: &str, value: &str) -> SyncResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| SyncError::Config(format!("invalid value for header {name}: {e}")))
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> SyncResult<Box<dyn Connection>> {
        let mut http = request.url.as_str().into_client_request()?;
        let headers = http.headers_mut();
        headers.insert(
            AUTHORIZATION,
            header_value("authorization", &format!("Bearer {}", request.token))?,
        );
        headers.insert(
            DEVICE_ID_HEADER,
            header_value(DEVICE_ID_HEADER, &request.device_id)?,
        );
        let capabilities = serde_json::to_string(&request.capabilities)?;
        headers.insert(
            CAPABILITIES_HEADER,
            header_value(CAPABILITIES_HEADER, &capabilities)?,
        );

        let (stream, response) = connect_async(http).await?;
        debug!(url = %request.url, status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> SyncResult<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> SyncResult<Option<String>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => debug!("ignoring non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed the connection");
                    return Ok(None);
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(other)) => trace!(?other, "ignoring control frame"),
                Some(Err(WsError::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) -> SyncResult<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
