//! Connection registry
//!
//! Associates every upgraded socket with its [`ServerConnection`] record.
//! Entries are keyed by a [`ConnectionKey`] handed out at insertion and must be
//! removed explicitly once the socket closes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::logger::{ChildFactory, Logger};

/// Identity of an upgraded socket within the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(Uuid);

impl ConnectionKey {
    /// Generate a fresh key
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Server-side record of an upgraded socket
#[derive(Debug, Clone)]
pub struct ServerConnection {
    id: String,
    logger: Logger,
}

impl ServerConnection {
    /// Create a record with a fresh id and a logger scoped to it
    pub fn new(loggers: &ChildFactory) -> Self {
        let child = loggers.create();
        Self {
            id: child.id().to_string(),
            logger: child.logger().clone(),
        }
    }

    /// Short id used for log correlation
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Logger for all traffic on this connection
    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

/// Table of live connections
///
/// Cloning yields another handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionKey, ServerConnection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning its key
    pub async fn insert(&self, connection: ServerConnection) -> ConnectionKey {
        let key = ConnectionKey::new();
        self.connections.write().await.insert(key, connection);
        key
    }

    /// Look up a connection
    pub async fn get(&self, key: &ConnectionKey) -> Option<ServerConnection> {
        self.connections.read().await.get(key).cloned()
    }

    /// Remove a connection, returning its record if it was registered
    pub async fn remove(&self, key: &ConnectionKey) -> Option<ServerConnection> {
        self.connections.write().await.remove(key)
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no connections are registered
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
