//! WebSocket connection handler
//!
//! Runs every upgraded socket once it has been registered. No application
//! messages are defined yet, so inbound frames are logged and dropped.

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::registry::{ConnectionKey, ConnectionRegistry};
use crate::logger::Logger;

/// Handles established WebSocket connections
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    registry: ConnectionRegistry,
    logger: Logger,
}

impl ConnectionHandler {
    /// Create a handler resolving connections through `registry`
    pub fn new(registry: ConnectionRegistry, logger: Logger) -> Self {
        Self { registry, logger }
    }

    /// Handle a socket that completed its upgrade
    ///
    /// Sockets without a registry entry are closed immediately. Registered
    /// sockets are served until they close or the server shuts down, after
    /// which their entry is removed.
    pub async fn handle<S>(
        &self,
        key: ConnectionKey,
        mut ws: WebSocketStream<S>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(connection) = self.registry.get(&key).await else {
            self.logger.warn("Unmatched WebSocket connection");
            let _ = ws.close(None).await;
            return;
        };
        let logger = connection.logger();
        logger.info("hello connection");

        loop {
            tokio::select! {
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            logger.debug(format!("Ignoring text message ({} bytes)", text.len()));
                        }
                        Some(Ok(Message::Binary(data))) => {
                            logger.debug(format!("Ignoring binary message ({} bytes)", data.len()));
                        }
                        Some(Ok(Message::Close(_))) => {
                            // Keep polling so the close reply gets flushed
                            logger.info("Client requested close");
                        }
                        Some(Ok(_)) => {
                            // Pings are answered by the protocol layer
                        }
                        Some(Err(e)) => {
                            logger.warn(format!("WebSocket error: {}", e));
                            break;
                        }
                        None => {
                            logger.info("Connection closed by peer");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    logger.info("Shutdown signal received, closing connection");
                    let _ = ws.close(None).await;
                    break;
                }
            }
        }

        self.registry.remove(&key).await;
        logger.debug("Connection removed from registry");
    }
}
