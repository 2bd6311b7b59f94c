//! Client connection state machine
//!
//! Pure transition logic for the auto-reconnecting client. The machine owns no
//! I/O: it updates the connection stores and returns [`Effect`]s which the
//! driver in `manager.rs` carries out. Each socket attempt is tagged with a
//! generation number so that events from a superseded socket are ignored.

use std::time::Duration;

use tokio::sync::oneshot;

use super::policy::{next_delay, reset_delay};
use super::store::Store;

/// Identifies one socket attempt
pub type Generation = u64;

/// Phase of the client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No open socket; a reconnect may be pending
    Disconnected,
    /// A socket is being opened
    Connecting,
    /// The socket completed its open handshake
    Connected,
    /// Disconnected on request; no further attempts are made
    Stopped,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The public connect call
    Connect,
    /// The socket of the given generation opened
    Opened(Generation),
    /// The socket of the given generation closed or failed to open
    Closed(Generation),
    /// The reconnect timer fired
    RetryElapsed,
    /// Intentional disconnect
    Disconnect,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Open a new socket tagged with the generation
    OpenSocket(Generation),
    /// Fire `RetryElapsed` after the delay
    ScheduleReconnect(Duration),
    /// Cancel the pending reconnect timer, if any
    CancelReconnect,
    /// Close the current socket, if any
    CloseSocket,
}

/// The client connection state machine
pub struct ClientMachine {
    phase: ConnectionPhase,
    generation: Generation,
    is_connected: Store<bool>,
    reconnect_delay: Store<Duration>,
    first_open: Option<oneshot::Sender<()>>,
}

impl ClientMachine {
    /// Create a machine in the `Disconnected` phase
    ///
    /// `first_open` is completed on the first successful open. It is dropped
    /// without a value if the machine is stopped before that.
    pub fn new(
        is_connected: Store<bool>,
        reconnect_delay: Store<Duration>,
        first_open: oneshot::Sender<()>,
    ) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            generation: 0,
            is_connected,
            reconnect_delay,
            first_open: Some(first_open),
        }
    }

    /// Current phase
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Generation of the most recent socket attempt
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Apply an event, returning the effects to carry out in order
    pub fn handle(&mut self, event: ClientEvent) -> Vec<Effect> {
        match (self.phase, event) {
            (ConnectionPhase::Disconnected, ClientEvent::Connect)
            | (ConnectionPhase::Disconnected, ClientEvent::RetryElapsed) => {
                self.generation += 1;
                self.phase = ConnectionPhase::Connecting;
                vec![Effect::OpenSocket(self.generation)]
            }
            (ConnectionPhase::Connecting, ClientEvent::Opened(generation))
                if generation == self.generation =>
            {
                self.phase = ConnectionPhase::Connected;
                if let Some(first_open) = self.first_open.take() {
                    let _ = first_open.send(());
                }
                self.is_connected.set(true);
                self.reconnect_delay.set(reset_delay());
                Vec::new()
            }
            (ConnectionPhase::Connecting, ClientEvent::Closed(generation))
            | (ConnectionPhase::Connected, ClientEvent::Closed(generation))
                if generation == self.generation =>
            {
                self.phase = ConnectionPhase::Disconnected;
                self.is_connected.set(false);

                let delay = self.reconnect_delay.get();
                self.reconnect_delay.set(next_delay(delay));
                vec![Effect::ScheduleReconnect(delay)]
            }
            (ConnectionPhase::Stopped, _) => Vec::new(),
            (_, ClientEvent::Disconnect) => {
                self.phase = ConnectionPhase::Stopped;
                self.first_open = None;
                self.is_connected.set(false);
                vec![Effect::CancelReconnect, Effect::CloseSocket]
            }
            _ => Vec::new(),
        }
    }
}
