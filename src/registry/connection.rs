//! Connection handles
//!
//! A handle is the non-owning side of a live connection: it can queue frames
//! for the connection's task, but it cannot close or drop the socket. The
//! lifecycle task that holds the receiving end owns the connection.

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::server::ServerMessage;

/// Unique identifier for a connection instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised when queueing a frame for a connection
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("Outbound queue for connection {0} is full")]
    QueueFull(ConnectionId),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for delivery operations
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Commands consumed by a connection's lifecycle task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame to write to the peer
    Text(String),
    /// Liveness tick: advance the probe state machine
    Probe,
}

/// Sending side of a live connection.
///
/// The queue is bounded: a peer that stops draining it loses frames instead
/// of growing server memory.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Option<String>,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its lifecycle task will own.
    ///
    /// `capacity` must be greater than zero.
    pub fn new(identity: Option<String>, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: ConnectionId::new(),
            identity,
            tx,
        };
        (handle, rx)
    }

    /// Connection ID
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Identity supplied at handshake, if any
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Whether the owning task is still accepting frames
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Serialize and queue a message
    pub fn send(&self, message: &ServerMessage) -> DeliveryResult<()> {
        self.send_text(message.to_json()?)
    }

    /// Queue an already-encoded text frame
    pub fn send_text(&self, text: String) -> DeliveryResult<()> {
        self.push(Outbound::Text(text))
    }

    /// Queue a liveness tick
    pub fn probe(&self) -> DeliveryResult<()> {
        self.push(Outbound::Probe)
    }

    fn push(&self, command: Outbound) -> DeliveryResult<()> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull(self.id),
            TrySendError::Closed(_) => DeliveryError::ConnectionClosed(self.id),
        })
    }
}
