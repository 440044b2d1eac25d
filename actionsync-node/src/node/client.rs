//! The handshake-initiating node.

use std::sync::Arc;

use tokio::sync::broadcast;

use actionsync_log::Log;

use super::{BaseNode, NodeEvent, NodeRole, NodeState};
use crate::config::ConfigError;
use crate::connection::{Connection, ConnectionError};
use crate::options::NodeOptions;

/// A sync node that initiates the handshake.
///
/// Sends `connect` as soon as the transport comes up; everything after the
/// handshake is shared with [`ServerNode`](super::ServerNode).
pub struct ClientNode {
    node: BaseNode,
}

impl ClientNode {
    /// Create a client node over the given log and connection.
    pub fn new(
        log: Log,
        connection: Arc<dyn Connection>,
        options: NodeOptions,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            node: BaseNode::start(NodeRole::Client, log, connection, options)?,
        })
    }

    /// Establish the connection and start the handshake.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.node.connect().await
    }

    /// Subscribe to node events.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.node.events()
    }

    /// The current synchronization state.
    pub fn state(&self) -> NodeState {
        self.node.state()
    }

    /// Tear the node down. Terminal.
    pub fn destroy(&self) {
        self.node.destroy();
    }

    /// The underlying state machine, for everything else.
    pub fn base(&self) -> &BaseNode {
        &self.node
    }
}
