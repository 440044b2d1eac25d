//! The handshake-answering node.

use std::sync::Arc;

use tokio::sync::broadcast;

use actionsync_log::Log;

use super::{BaseNode, NodeEvent, NodeRole, NodeState};
use crate::config::ConfigError;
use crate::connection::Connection;
use crate::options::NodeOptions;

/// A sync node that answers the handshake.
///
/// Waits for the peer's `connect`, checks protocol, credentials and
/// subprotocol, and replies `connected`; everything after the handshake is
/// shared with [`ClientNode`](super::ClientNode).
pub struct ServerNode {
    node: BaseNode,
}

impl ServerNode {
    /// Create a server node over the given log and connection.
    pub fn new(
        log: Log,
        connection: Arc<dyn Connection>,
        options: NodeOptions,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            node: BaseNode::start(NodeRole::Server, log, connection, options)?,
        })
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
