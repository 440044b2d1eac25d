//! Protocol error taxonomy.

use serde_json::{json, Value};
use thiserror::Error;

use crate::ProtocolVersion;

/// The kinds of protocol errors a node can raise or receive.
///
/// Carried on the wire as `["error", kind, detail?]`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    /// Handshake failed because the peers speak incompatible protocol majors.
    #[error("wrong protocol version: used {used}, supported {supported}")]
    WrongProtocol {
        /// The version the rejecting side supports.
        supported: ProtocolVersion,
        /// The version the peer announced.
        used: ProtocolVersion,
    },

    /// The host's credential check rejected the peer.
    #[error("authentication was rejected")]
    WrongCredentials,

    /// The peer's application subprotocol is not acceptable.
    #[error("wrong subprotocol: used {used}, supported {supported}")]
    WrongSubprotocol {
        /// Description of acceptable subprotocol versions.
        supported: String,
        /// The version the peer announced.
        used: String,
    },

    /// The peer sent a message that requires authentication first.
    #[error("message was sent before authentication: {0}")]
    MissedAuth(String),

    /// The peer sent a frame that does not match the wire grammar.
    #[error("wrong message format: {0}")]
    WrongFormat(String),

    /// The peer sent a frame with an unrecognized command tag.
    #[error("unknown message type: {0}")]
    UnknownMessage(String),

    /// The peer retried authentication too many times.
    #[error("too many authentication attempts")]
    Bruteforce,

    /// The peer stopped answering within the configured timeout.
    #[error("no answer from the peer within {0} ms")]
    Timeout(u64),
}

impl ErrorKind {
    /// Whether this kind forbids automatic reconnection.
    ///
    /// Retrying a handshake that failed on protocol, credentials or
    /// subprotocol would fail the same way every time.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorKind::WrongProtocol { .. }
                | ErrorKind::WrongCredentials
                | ErrorKind::WrongSubprotocol { .. }
        )
    }

    /// The wire tag for this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::WrongProtocol { .. } => "wrong-protocol",
            ErrorKind::WrongCredentials => "wrong-credentials",
            ErrorKind::WrongSubprotocol { .. } => "wrong-subprotocol",
            ErrorKind::MissedAuth(_) => "missed-auth",
            ErrorKind::WrongFormat(_) => "wrong-format",
            ErrorKind::UnknownMessage(_) => "unknown-message",
            ErrorKind::Bruteforce => "bruteforce",
            ErrorKind::Timeout(_) => "timeout",
        }
    }

    /// The wire detail payload for this kind, if any.
    pub fn detail(&self) -> Option<Value> {
        match self {
            ErrorKind::WrongProtocol { supported, used } => Some(json!({
                "supported": supported,
                "used": used,
            })),
            ErrorKind::WrongSubprotocol { supported, used } => Some(json!({
                "supported": supported,
                "used": used,
            })),
            ErrorKind::MissedAuth(received) => Some(Value::String(received.clone())),
            ErrorKind::WrongFormat(received) => Some(Value::String(received.clone())),
            ErrorKind::UnknownMessage(tag) => Some(Value::String(tag.clone())),
            ErrorKind::Timeout(ms) => Some(json!(ms)),
            ErrorKind::WrongCredentials | ErrorKind::Bruteforce => None,
        }
    }

    /// Rebuild a kind from its wire tag and detail. `None` for unknown tags.
    pub fn from_wire(tag: &str, detail: Option<&Value>) -> Option<Self> {
        fn versions(detail: Option<&Value>) -> Option<(ProtocolVersion, ProtocolVersion)> {
            let detail = detail?;
            let supported = serde_json::from_value(detail.get("supported")?.clone()).ok()?;
            let used = serde_json::from_value(detail.get("used")?.clone()).ok()?;
            Some((supported, used))
        }
        fn strings(detail: Option<&Value>) -> Option<(String, String)> {
            let detail = detail?;
            Some((
                detail.get("supported")?.as_str()?.to_string(),
                detail.get("used")?.as_str()?.to_string(),
            ))
        }
        fn text(detail: Option<&Value>) -> String {
            detail
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        }

        match tag {
            "wrong-protocol" => {
                let (supported, used) = versions(detail)?;
                Some(ErrorKind::WrongProtocol { supported, used })
            }
            "wrong-credentials" => Some(ErrorKind::WrongCredentials),
            "wrong-subprotocol" => {
                let (supported, used) = strings(detail)?;
                Some(ErrorKind::WrongSubprotocol { supported, used })
            }
            "missed-auth" => Some(ErrorKind::MissedAuth(text(detail))),
            "wrong-format" => Some(ErrorKind::WrongFormat(text(detail))),
            "unknown-message" => Some(ErrorKind::UnknownMessage(text(detail))),
            "bruteforce" => Some(ErrorKind::Bruteforce),
            "timeout" => Some(ErrorKind::Timeout(detail.and_then(Value::as_u64).unwrap_or(0))),
            _ => None,
        }
    }
}

/// A protocol error, local or delivered by the peer.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}")]
pub struct SyncError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Whether the error was reported by the remote peer over the wire.
    pub remote: bool,
}

impl SyncError {
    /// A locally detected error.
    pub fn local(kind: ErrorKind) -> Self {
        Self {
            kind,
            remote: false,
        }
    }

    /// An error received from the peer.
    pub fn remote(kind: ErrorKind) -> Self {
        Self { kind, remote: true }
    }

    /// Whether this error forbids automatic reconnection.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}
