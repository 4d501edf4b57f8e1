//! Outbound client transport over tokio-tungstenite.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Transport, TransportConnector, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `ws://`/`wss://` addresses for outbound managed sessions.
#[derive(Debug, Clone, Default)]
pub struct WsClientConnector;

impl WsClientConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for WsClientConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let (stream, _response) = connect_async(address)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!(address = %address, "WebSocket client connection established");

        Ok(Arc::new(WsClientTransport::new(stream)))
    }
}

/// A connected client socket, split so that concurrent send and recv never
/// contend on the same lock.
pub struct WsClientTransport {
    writer: Mutex<SplitSink<WsStream, Message>>,
    reader: Mutex<SplitStream<WsStream>>,
}

impl WsClientTransport {
    pub fn new(stream: WsStream) -> Self {
        let (writer, reader) = stream.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(_))) => {
                    // Wire protocol is JSON over text frames
                    tracing::debug!("Ignoring unexpected binary frame");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Protocol-level ping/pong handled by tungstenite;
                    // application heartbeats travel as JSON text frames
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(Message::Frame(_))) => {
                    // Raw frames never surface outside tungstenite internals
                }
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }
}
