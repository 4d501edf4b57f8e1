//! Transport boundary for managed connections.
//!
//! A `Transport` is a live, bidirectional text-frame channel. The reliability
//! core never touches a socket type directly; outbound sessions dial through
//! a `TransportConnector`, inbound sessions wrap an already-accepted socket.

mod axum_socket;
mod tungstenite;

pub use axum_socket::AxumWsTransport;
pub use tungstenite::WsClientConnector;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the channel or the channel is no longer usable.
    #[error("transport closed")]
    Closed,

    #[error("connect error: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// A live bidirectional text-frame channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame. Errors propagate to the caller for
    /// connection-error handling.
    async fn send(&self, text: &str) -> Result<(), TransportError>;

    /// Receive the next text frame, blocking until one arrives.
    async fn recv(&self) -> Result<String, TransportError>;

    /// Best-effort close of the underlying channel.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens a `Transport` to an address. Reconnection re-invokes the connector.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Connector for server-accepted sockets: yields the established transport
/// exactly once. A dropped inbound session cannot be redialed from this side,
/// so later attempts fail and the normal limit path retires the connection.
pub struct PreEstablishedConnector {
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl PreEstablishedConnector {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
        }
    }
}

#[async_trait]
impl TransportConnector for PreEstablishedConnector {
    async fn connect(&self, _address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.transport.lock().await.take().ok_or_else(|| {
            TransportError::Connect("session must be re-established by the client".to_string())
        })
    }
}
