use crate::error::{Result, VocalsError};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Write half of an open connection
#[async_trait]
pub trait TransportSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Read half of an open connection
#[async_trait]
pub trait TransportStream: Send {
    /// Next text message; `None` once the peer closed the connection
    async fn next_text(&mut self) -> Option<Result<String>>;
}

/// Opens duplex text connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        let mut request = url.into_client_request()?;
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| VocalsError::config(format!("invalid header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| VocalsError::config(format!("invalid value for header '{}': {}", key, e)))?;
            request.headers_mut().insert(name, value);
        }

        let (ws_stream, response) = tokio_tungstenite::connect_async(request).await?;
        debug!("WebSocket handshake complete ({})", response.status());

        let (writer, reader) = ws_stream.split();
        Ok((
            Box::new(WsSink { writer }),
            Box::new(WsReader { reader }),
        ))
    }
}

struct WsSink {
    writer: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.close().await?;
        Ok(())
    }
}

struct WsReader {
    reader: SplitStream<WsStream>,
}

#[async_trait]
impl TransportStream for WsReader {
    async fn next_text(&mut self) -> Option<Result<String>> {
        while let Some(message) = self.reader.next().await {
            match message {
                Ok(Message::Text(t)) => return Some(Ok(t.to_string())),
                Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!("Dropping non-UTF-8 binary message ({} bytes)", b.len()),
                },
                Ok(Message::Close(frame)) => {
                    debug!("Server closed connection: {:?}", frame);
                    return None;
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}
