//! Connection Registry implementation.
//!
//! Tracks active relay connections by client key for message routing.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, instrument, warn};

use crate::metrics;
use crate::types::{ClientKey, ConnectionId};

/// A frame to be written to a connection.
///
/// This is the message type sent through the outbound queue to deliver
/// text to connected clients. The line terminator is added by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    text: String,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Result of attempting to send a frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Frame was queued for delivery
    Sent,
    /// The recipient is not currently connected
    NotConnected,
    /// The recipient's queue stayed full for the whole send timeout
    QueueFull,
    /// The recipient's queue is closed (connection going away)
    ChannelClosed,
}

impl SendResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendResult::Sent => "sent",
            SendResult::NotConnected => "not_connected",
            SendResult::QueueFull => "queue_full",
            SendResult::ChannelClosed => "channel_closed",
        }
    }
}

/// Handle to one live connection.
///
/// Cloning is cheap. Clones share the outbound queue and the liveness
/// token; identity is the [`ConnectionId`], not the key.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    key: ClientKey,
    id: ConnectionId,
    sender: mpsc::Sender<OutboundFrame>,
    liveness: CancellationToken,
}

impl ClientHandle {
    /// Create a handle for a freshly accepted connection.
    pub fn new(key: ClientKey, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            key,
            id: ConnectionId::new(),
            sender,
            liveness: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &ClientHandle) -> bool {
        self.id == other.id
    }

    /// False once the connection has been asked to close.
    pub fn is_alive(&self) -> bool {
        !self.liveness.is_cancelled()
    }

    /// Ask the connection to close. Never blocks; idempotent.
    pub fn close(&self) {
        self.liveness.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.liveness.cancelled()
    }

    /// Token shared by every clone, for tasks that outlive a borrow.
    pub fn liveness_token(&self) -> CancellationToken {
        self.liveness.clone()
    }

    /// Queue a frame, waiting at most `timeout` for queue space.
    pub async fn deliver(&self, frame: OutboundFrame, timeout: Duration) -> SendResult {
        match self.sender.send_timeout(frame, timeout).await {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => SendResult::QueueFull,
            Err(mpsc::error::SendTimeoutError::Closed(_)) => SendResult::ChannelClosed,
        }
    }
}

/// Registry for tracking active relay connections.
///
/// Thread-safe registry that maps client keys to connection handles.
/// Every operation goes through `DashMap`'s per-shard locks, so `register`,
/// `lookup` and `unregister` are atomic with respect to each other. No lock
/// is held across an `.await`.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
///
/// // When a connection is identified:
/// let (tx, rx) = mpsc::channel(64);
/// let handle = ClientHandle::new(key.clone(), tx);
/// registry.register(handle.clone());
///
/// // When routing a frame:
/// let result = registry.send_to("bob", frame, timeout).await;
///
/// // When the connection closes:
/// registry.unregister(&key, &handle);
/// ```
pub struct ConnectionRegistry {
    /// Map of client key to its current connection handle
    connections: DashMap<ClientKey, ClientHandle>,
}

impl ConnectionRegistry {
    /// Create a new connection registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection handle under its key.
    ///
    /// If a connection with the same key already exists it is replaced and
    /// asked to close; its own handler tears it down asynchronously. The
    /// replaced handle is returned.
    #[instrument(skip(self, handle), fields(key = %handle.key(), connection_id = %handle.id()))]
    pub fn register(&self, handle: ClientHandle) -> Option<ClientHandle> {
        let key = handle.key().clone();
        let previous = self.connections.insert(key, handle);
        // The shard lock is released once insert returns.
        match &previous {
            Some(old) => {
                old.close();
                info!(replaced = %old.id(), "Replaced existing registration");
            }
            None => debug!("Registered new connection"),
        }
        metrics::record_connection_count(self.connections.len() as i64);
        previous
    }

    /// Look up the current handle for a key.
    pub fn lookup(&self, key: &str) -> Option<ClientHandle> {
        self.connections.get(key).map(|entry| entry.value().clone())
    }

    /// Unregister a connection.
    ///
    /// Removes the entry for `key` only if it still belongs to `handle`'s
    /// connection. A handler whose entry was already replaced by a
    /// reconnect gets `false` and leaves the newer entry alone.
    #[instrument(skip(self, handle), fields(key = %key, connection_id = %handle.id()))]
    pub fn unregister(&self, key: &ClientKey, handle: &ClientHandle) -> bool {
        let removed = self
            .connections
            .remove_if(key, |_, current| current.same_connection(handle))
            .is_some();
        if removed {
            debug!("Unregistered connection");
            metrics::record_connection_count(self.connections.len() as i64);
        } else {
            debug!("Entry missing or owned by a newer connection");
        }
        removed
    }

    /// Check if a key is currently connected.
    pub fn is_connected(&self, key: &str) -> bool {
        self.connections.contains_key(key)
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Send a frame to a connected client.
    ///
    /// The handle is cloned out of the map before waiting, so a slow
    /// recipient never holds a registry lock.
    #[instrument(skip(self, frame), fields(to = %key))]
    pub async fn send_to(&self, key: &str, frame: OutboundFrame, timeout: Duration) -> SendResult {
        let Some(handle) = self.lookup(key) else {
            debug!("Recipient not connected");
            return SendResult::NotConnected;
        };

        let result = handle.deliver(frame, timeout).await;
        match result {
            SendResult::Sent => debug!("Frame queued for delivery"),
            SendResult::QueueFull => warn!("Outbound queue full, frame dropped"),
            SendResult::ChannelClosed => {
                debug!("Outbound queue closed, connection may have dropped")
            }
            SendResult::NotConnected => {}
        }
        result
    }

    /// List all connected keys.
    ///
    /// Useful for debugging and monitoring.
    pub fn list_connections(&self) -> Vec<ClientKey> {
        self.connections.iter().map(|r| r.key().clone()).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .finish()
    }
}
