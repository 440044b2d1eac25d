//! Host-supplied behavior hooks for sync nodes.
//!
//! Credentials checking, subprotocol acceptance and per-action sync policy
//! are seams the host plugs into. Defaults accept everything and pass
//! actions through unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use actionsync_log::TimeSource;
use actionsync_types::{Action, Meta};

use crate::config::NodeConfig;

/// Failure of an authentication backend (not a rejection).
#[derive(Debug, Error)]
#[error("authentication backend failure: {0}")]
pub struct AuthError(pub String);

/// Checks a peer's credentials during the handshake.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Return `Ok(false)` to reject the peer with `wrong-credentials`.
    async fn authenticate(
        &self,
        node_id: &str,
        credentials: Option<&Value>,
    ) -> Result<bool, AuthError>;
}

/// The default authenticator: accepts every peer.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(
        &self,
        _node_id: &str,
        _credentials: Option<&Value>,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }
}

/// Filters and rewrites actions crossing the connection.
///
/// `out` hooks run before an entry is sent, `in` hooks after one is
/// received and time-adjusted, before it reaches the log.
#[async_trait]
pub trait SyncPolicy: Send + Sync {
    /// Whether to send this local entry to the peer.
    async fn filter_out(&self, _action: &Action, _meta: &Meta) -> bool {
        true
    }

    /// Rewrite an outgoing entry.
    async fn map_out(&self, action: Action, meta: Meta) -> (Action, Meta) {
        (action, meta)
    }

    /// Whether to accept this entry from the peer.
    async fn filter_in(&self, _action: &Action, _meta: &Meta) -> bool {
        true
    }

    /// Rewrite an incoming entry.
    async fn map_in(&self, action: Action, meta: Meta) -> (Action, Meta) {
        (action, meta)
    }
}

/// The default policy: everything crosses unchanged.
pub struct PassThrough;

#[async_trait]
impl SyncPolicy for PassThrough {}

/// Decides whether a peer's application subprotocol is acceptable.
#[derive(Clone)]
pub struct SubprotocolMatcher {
    /// Human-readable description of acceptable versions, used in the
    /// `wrong-subprotocol` error detail.
    pub supported: String,
    check: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl SubprotocolMatcher {
    /// Accept versions the given predicate approves of.
    pub fn new(
        supported: impl Into<String>,
        check: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            supported: supported.into(),
            check: Arc::new(check),
        }
    }

    /// Accept versions sharing the major component of `version`
    /// (`"1.2.0"` accepts `"1.0.0"` but not `"2.0.0"`).
    pub fn same_major(version: &str) -> Self {
        let major = version.split('.').next().unwrap_or("").to_string();
        let supported = format!("{major}.x");
        Self::new(supported, move |remote| {
            remote.split('.').next() == Some(major.as_str())
        })
    }

    /// Whether the peer's version is acceptable.
    pub fn matches(&self, remote: &str) -> bool {
        (self.check)(remote)
    }
}

impl std::fmt::Debug for SubprotocolMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprotocolMatcher")
            .field("supported", &self.supported)
            .finish_non_exhaustive()
    }
}

/// Everything a [`BaseNode`](crate::BaseNode) needs besides its log and
/// connection: plain configuration plus behavior hooks.
#[derive(Clone)]
pub struct NodeOptions {
    /// Heartbeat, time-fix and handshake settings.
    pub config: NodeConfig,
    /// Credential check used by the handshake responder.
    pub auth: Arc<dyn Authenticator>,
    /// Per-action sync filters and rewrites.
    pub policy: Arc<dyn SyncPolicy>,
    /// Acceptable peer subprotocols. `None` accepts everything.
    pub subprotocols: Option<SubprotocolMatcher>,
    /// Time source override; defaults to the log's.
    pub time: Option<TimeSource>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self::new(NodeConfig::default())
    }
}

impl NodeOptions {
    /// Options with the given configuration and default hooks.
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            auth: Arc::new(AllowAll),
            policy: Arc::new(PassThrough),
            subprotocols: None,
            time: None,
        }
    }

    /// Replace the authenticator.
    pub fn with_auth(mut self, auth: impl Authenticator + 'static) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    /// Replace the sync policy.
    pub fn with_policy(mut self, policy: impl SyncPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Restrict acceptable peer subprotocols.
    pub fn with_subprotocols(mut self, matcher: SubprotocolMatcher) -> Self {
        self.subprotocols = Some(matcher);
        self
    }

    /// Override the time source (tests, virtual clocks).
    pub fn with_time_source(mut self, time: TimeSource) -> Self {
        self.time = Some(time);
        self
    }
}
