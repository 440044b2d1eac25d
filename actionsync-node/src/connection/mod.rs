//! The connection contract consumed by sync nodes.
//!
//! A connection is a minimal duplex transport for wire frames with lifecycle
//! events. Implementations must deliver successfully sent frames in order
//! and without duplication for the lifetime of one connected interval;
//! frames buffered at disconnect time may be dropped.
//!
//! [`LocalPair`](crate::LocalPair) is the in-process implementation used in
//! tests and same-process peers; network adapters (WebSocket, TCP) live
//! outside this crate. [`Reconnect`](crate::Reconnect) wraps any connection
//! and re-exposes this contract with supervised reconnection.

pub(crate) mod pair;
pub(crate) mod reconnect;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use actionsync_types::Frame;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The owner destroyed the connection. Never followed by a reconnect.
    Destroy,
    /// A session-level failure; reconnecting may help.
    Error,
    /// The peer stopped answering the heartbeat.
    Timeout,
    /// The host environment froze the process.
    Freeze,
    /// A terminal protocol failure; reconnecting would fail the same way.
    Protocol,
}

/// Lifecycle and traffic events emitted by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection attempt started.
    Connecting,
    /// The connection is established.
    Connect,
    /// A frame arrived from the peer.
    Message(Frame),
    /// The connection closed, with the closer's reason when known.
    Disconnect(Option<DisconnectReason>),
    /// A transport-level failure that did not close the connection.
    Error(String),
}

/// Errors returned by connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection is not established.
    #[error("connection is not established")]
    NotConnected,
    /// Establishing the connection failed.
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    /// The connection was destroyed and cannot be used again.
    #[error("connection was destroyed")]
    Destroyed,
}

/// A bidirectional, ordered frame transport with lifecycle events.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the connection is currently established.
    fn connected(&self) -> bool;

    /// Establish the connection.
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Close the connection, reporting why.
    fn disconnect(&self, reason: Option<DisconnectReason>);

    /// Send one frame to the peer.
    fn send(&self, frame: Frame) -> Result<(), ConnectionError>;

    /// Subscribe to lifecycle and traffic events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Tear the connection down permanently.
    fn destroy(&self);
}
