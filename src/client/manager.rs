//! Client socket manager
//!
//! Owns the single outbound WebSocket and keeps it alive. Socket attempts and
//! the reconnect timer run as separate tasks that report back to one driver
//! task over a channel; the driver feeds those events to the
//! [`ClientMachine`] and carries out the effects it returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::machine::{ClientEvent, ClientMachine, Effect, Generation};
use super::policy::RECONNECT_DELAY_INITIAL;
use super::store::{ReadableStore, Store};
use super::transport::{Connector, WebSocketConnector};

/// Errors returned by [`SocketManager::connect`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("WebSocket connection already initialized")]
    AlreadyInitialized,

    #[error("Disconnected before the connection was established")]
    Disconnected,
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Auto-reconnecting WebSocket client
pub struct SocketManager {
    url: String,
    connector: Arc<dyn Connector>,
    is_connected: Store<bool>,
    reconnect_delay: Store<Duration>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl SocketManager {
    /// Create a manager connecting to `url` with a real WebSocket connector
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_connector(url, WebSocketConnector)
    }

    /// Create a manager using a custom connector
    pub fn with_connector(url: impl Into<String>, connector: impl Connector) -> Self {
        Self {
            url: url.into(),
            connector: Arc::new(connector),
            is_connected: Store::new(false),
            reconnect_delay: Store::new(RECONNECT_DELAY_INITIAL),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// URL the manager connects to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the client currently holds an open socket
    pub fn is_connected(&self) -> ReadableStore<bool> {
        self.is_connected.readable()
    }

    /// Delay before the next reconnection attempt
    pub fn reconnect_delay(&self) -> ReadableStore<Duration> {
        self.reconnect_delay.readable()
    }

    /// Start connecting, resolving once the first socket opens
    ///
    /// May only be called once per manager. Later connection losses are
    /// retried internally and never surface here.
    pub async fn connect(&self) -> ClientResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyInitialized);
        }

        let (first_open_tx, first_open_rx) = oneshot::channel();
        let machine = ClientMachine::new(
            self.is_connected.clone(),
            self.reconnect_delay.clone(),
            first_open_tx,
        );

        let driver = Driver::new(
            self.url.clone(),
            Arc::clone(&self.connector),
            machine,
            self.cancel.clone(),
        );
        tokio::spawn(driver.run());

        first_open_rx.await.map_err(|_| ClientError::Disconnected)
    }

    /// Stop retrying and close the current socket
    pub fn disconnect(&self) {
        info!("Disconnecting from {}", self.url);
        self.cancel.cancel();
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs the state machine and owns the socket and timer tasks
struct Driver {
    url: String,
    connector: Arc<dyn Connector>,
    machine: ClientMachine,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
    socket: Option<CancellationToken>,
    timer: Option<JoinHandle<()>>,
}

impl Driver {
    fn new(
        url: String,
        connector: Arc<dyn Connector>,
        machine: ClientMachine,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            url,
            connector,
            machine,
            cancel,
            events_tx,
            events_rx,
            socket: None,
            timer: None,
        }
    }

    async fn run(mut self) {
        let effects = self.machine.handle(ClientEvent::Connect);
        self.apply(effects);

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => ClientEvent::Disconnect,
                Some(event) = self.events_rx.recv() => event,
            };

            let effects = self.machine.handle(event);
            self.apply(effects);

            if event == ClientEvent::Disconnect {
                break;
            }
        }

        debug!("Socket driver for {} stopped", self.url);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::OpenSocket(generation) => self.open_socket(generation),
                Effect::ScheduleReconnect(delay) => self.schedule_reconnect(delay),
                Effect::CancelReconnect => {
                    if let Some(timer) = self.timer.take() {
                        timer.abort();
                    }
                }
                Effect::CloseSocket => {
                    if let Some(socket) = self.socket.take() {
                        socket.cancel();
                    }
                }
            }
        }
    }

    fn open_socket(&mut self, generation: Generation) {
        debug!("Opening socket #{} to {}", generation, self.url);

        let token = self.cancel.child_token();
        if let Some(previous) = self.socket.replace(token.clone()) {
            previous.cancel();
        }

        let url = self.url.clone();
        let connector = Arc::clone(&self.connector);
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = connector.connect(&url) => result,
            };

            match result {
                Ok(mut transport) => {
                    info!("Connected to {}", url);
                    let _ = events_tx.send(ClientEvent::Opened(generation));

                    let cancelled = tokio::select! {
                        _ = token.cancelled() => true,
                        _ = transport.closed() => false,
                    };
                    if cancelled {
                        transport.close().await;
                        return;
                    }
                    info!("Connection to {} closed", url);
                }
                Err(e) => {
                    debug!("Failed to connect to {}: {}", url, e);
                }
            }

            let _ = events_tx.send(ClientEvent::Closed(generation));
        });
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        info!("Reconnecting to {} in {}ms", self.url, delay.as_millis());

        let events_tx = self.events_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(ClientEvent::RetryElapsed);
        });

        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }
}
