//! Client transport
//!
//! The socket manager only needs to know when a socket opens and when it goes
//! away, so the transport surface is two small async traits. The production
//! implementation is backed by `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Errors raised while opening a socket
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Opens client sockets
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a socket to `url`, completing once the open handshake is done
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// An open client socket
#[async_trait]
pub trait Transport: Send {
    /// Resolve once the socket has closed, cleanly or not
    async fn closed(&mut self);

    /// Close the socket from this side
    async fn close(&mut self);
}

/// Connector opening real WebSocket connections
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, response) = connect_async(url).await?;
        debug!("Handshake with {} completed ({})", url, response.status());
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn closed(&mut self) {
        // No application messages are defined yet, inbound frames are drained
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Close(frame)) => {
                    debug!("Server closed the connection: {:?}", frame);
                }
                Ok(Message::Text(text)) => {
                    debug!("Ignoring text message ({} bytes)", text.len());
                }
                Ok(Message::Binary(data)) => {
                    debug!("Ignoring binary message ({} bytes)", data.len());
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error: {}", e);
                    break;
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Error closing WebSocket: {}", e);
        }
    }
}
