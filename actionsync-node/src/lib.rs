//! # actionsync-node
//!
//! Synchronization nodes for the actionsync protocol.
//!
//! A node binds one [`Log`](actionsync_log::Log) to one [`Connection`] and
//! keeps both peers' logs converged: handshake with authentication and
//! clock-offset estimation, incremental backlog streaming with per-peer
//! cursors, heartbeat, and the protocol error taxonomy.
//!
//! - [`ClientNode`] / [`ServerNode`] - the two handshake roles over the
//!   shared [`BaseNode`] state machine
//! - [`Connection`] - the transport contract, with [`LocalPair`] as the
//!   in-process implementation
//! - [`Reconnect`] - a connection wrapper adding supervised reconnection
//!   with exponential backoff and host environment signals
//! - [`NodeConfig`] / [`ReconnectConfig`] - TOML-loadable settings;
//!   [`NodeOptions`] adds the programmatic hooks (authenticator, sync
//!   policy, subprotocol matcher)

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod connection;
mod node;
mod options;

pub use config::{ConfigError, NodeConfig, ReconnectConfig, SyncSettings};
pub use connection::pair::{LocalConnection, LocalPair};
pub use connection::reconnect::{random_jitter, HostSignal, JitterSource, Reconnect};
pub use connection::{Connection, ConnectionError, ConnectionEvent, DisconnectReason};
pub use node::{BaseNode, ClientNode, NodeError, NodeEvent, NodeState, ServerNode};
pub use options::{
    AllowAll, AuthError, Authenticator, NodeOptions, PassThrough, SubprotocolMatcher, SyncPolicy,
};
