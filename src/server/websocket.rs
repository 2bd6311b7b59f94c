//! HTTP/WebSocket server implementation
//!
//! Listens on a configurable address and passes every accepted connection
//! through the upgrade gate.

use std::path::PathBuf;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use super::gate::UpgradeGate;
use super::registry::ConnectionRegistry;
use super::static_files::StaticFiles;
use crate::endpoint::{DEFAULT_HOST, DEFAULT_PORT, SOCKET_PATH};
use crate::logger::Logger;

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Directory served for plain HTTP requests
    pub static_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            static_dir: None,
        }
    }

    /// Set the static file directory
    pub fn with_static_dir(mut self, static_dir: Option<PathBuf>) -> Self {
        self.static_dir = static_dir;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST.to_string(), DEFAULT_PORT)
    }
}

/// HTTP server accepting WebSocket upgrades on the socket path
pub struct WebSocketServer {
    config: ServerConfig,
    gate: UpgradeGate,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let static_files = config.static_dir.clone().map(StaticFiles::new);
        let gate = UpgradeGate::new(ConnectionRegistry::new(), &Logger::root(), shutdown_tx.clone())
            .with_static_files(static_files);

        Self {
            config,
            gate,
            shutdown_tx,
        }
    }

    /// Registry of live WebSocket connections
    pub fn registry(&self) -> &ConnectionRegistry {
        self.gate.registry()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run the server
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.serve(listener).await
    }

    /// Run the server on an already bound listener
    ///
    /// Connections are handled concurrently. The server stops accepting when a
    /// shutdown signal is received; idle connections are closed and open
    /// WebSockets receive a close frame.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("Server started on {}", addr);
        info!("WebSocket endpoint at ws://{}{}", addr, SOCKET_PATH);
        if let Some(static_dir) = &self.config.static_dir {
            info!("Serving static files from {}", static_dir.display());
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let gate = self.gate.clone();

                            tokio::spawn(async move {
                                trace!("Accepted connection from {}", peer_addr);
                                if let Err(e) = gate.serve_connection(stream).await {
                                    // Peers hanging up mid-request is routine
                                    if e.is_incomplete_message() {
                                        debug!("Connection from {} closed early: {}", peer_addr, e);
                                    } else {
                                        warn!("Connection from {} ended: {}", peer_addr, e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let open = self.registry().len().await;
        if open > 0 {
            info!("Closing {} open WebSocket connections...", open);
        }

        Ok(())
    }
}
