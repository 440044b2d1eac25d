//! Protocol messages and the array-framed wire codec.
//!
//! Every message is framed as a JSON array whose first element is the
//! command tag, e.g. `["ping", 12]` or `["sync", 3, {..action..},
//! {..meta..}]`. [`Message::decode`] validates tag, arity and element types
//! and reports violations with the offending frame's JSON text, which the
//! node forwards to the peer as a `wrong-format` error.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::{Action, ErrorKind, Meta};

/// A raw wire frame: one JSON value as delivered by a connection.
pub type Frame = Value;

/// The sync protocol version as a `(major, minor)` pair.
///
/// Peers with different majors cannot talk to each other; the handshake
/// fails with a `wrong-protocol` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u32, pub u32);

impl ProtocolVersion {
    /// The protocol version this crate implements.
    pub const CURRENT: ProtocolVersion = ProtocolVersion(0, 4);

    /// Whether a peer announcing `other` can interoperate with this version.
    pub fn compatible(&self, other: &ProtocolVersion) -> bool {
        self.0 == other.0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// Optional fields of the `connect`/`connected` handshake messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectExtras {
    /// Opaque credentials for the responder's authenticator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
    /// The sender's application subprotocol version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subprotocol: Option<String>,
}

impl ConnectExtras {
    fn is_empty(&self) -> bool {
        self.credentials.is_none() && self.subprotocol.is_none()
    }
}

/// A protocol message exchanged between two sync nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake request from the initiator.
    Connect {
        /// The initiator's protocol version.
        protocol: ProtocolVersion,
        /// The initiator's node id.
        node_id: String,
        /// The initiator's highest `added` at send time.
        synced: u64,
        /// Credentials and subprotocol, when present.
        extras: ConnectExtras,
    },
    /// Handshake reply from the responder.
    Connected {
        /// The responder's protocol version.
        protocol: ProtocolVersion,
        /// The responder's node id.
        node_id: String,
        /// `(receive, reply)` timestamps for time-offset estimation.
        timing: (i64, i64),
        /// Subprotocol and other extras, when present.
        extras: ConnectExtras,
    },
    /// Keep-alive probe carrying the sender's highest `added`.
    Ping(u64),
    /// Keep-alive answer carrying the sender's highest `added`.
    Pong(u64),
    /// A batch of new log entries up to `synced`.
    Sync {
        /// The highest `added` among the batched entries.
        synced: u64,
        /// The batched `(action, meta)` pairs.
        entries: Vec<(Action, Meta)>,
    },
    /// Acknowledgement that a `sync` batch up to `synced` was processed.
    Synced(u64),
    /// A protocol error report.
    Error(ErrorKind),
    /// Free-form diagnostics, ignored by nodes that do not understand them.
    Debug {
        /// A debug record discriminator.
        kind: String,
        /// Arbitrary payload.
        data: Value,
    },
}

/// Why a frame could not be decoded into a [`Message`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The frame is an array with a string tag, but the tag is not a known
    /// command.
    #[error("unknown message command: {0}")]
    UnknownCommand(String),
    /// The frame violates the wire grammar. Carries the frame's JSON text.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl Message {
    /// The command tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "connect",
            Message::Connected { .. } => "connected",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Sync { .. } => "sync",
            Message::Synced(_) => "synced",
            Message::Error(_) => "error",
            Message::Debug { .. } => "debug",
        }
    }

    /// Encode this message as its wire frame.
    pub fn encode(&self) -> Frame {
        match self {
            Message::Connect {
                protocol,
                node_id,
                synced,
                extras,
            } => {
                let mut frame = vec![
                    json!("connect"),
                    json!(protocol),
                    json!(node_id),
                    json!(synced),
                ];
                if !extras.is_empty() {
                    frame.push(json!(extras));
                }
                Value::Array(frame)
            }
            Message::Connected {
                protocol,
                node_id,
                timing,
                extras,
            } => {
                let mut frame = vec![
                    json!("connected"),
                    json!(protocol),
                    json!(node_id),
                    json!([timing.0, timing.1]),
                ];
                if !extras.is_empty() {
                    frame.push(json!(extras));
                }
                Value::Array(frame)
            }
            Message::Ping(synced) => json!(["ping", synced]),
            Message::Pong(synced) => json!(["pong", synced]),
            Message::Sync { synced, entries } => {
                let mut frame = vec![json!("sync"), json!(synced)];
                for (action, meta) in entries {
                    frame.push(json!(action));
                    frame.push(json!(meta));
                }
                Value::Array(frame)
            }
            Message::Synced(synced) => json!(["synced", synced]),
            Message::Error(kind) => match kind.detail() {
                Some(detail) => json!(["error", kind.tag(), detail]),
                None => json!(["error", kind.tag()]),
            },
            Message::Debug { kind, data } => json!(["debug", kind, data]),
        }
    }

    /// Decode a wire frame, validating it against the grammar.
    pub fn decode(frame: &Frame) -> Result<Message, DecodeError> {
        let malformed = || DecodeError::Malformed(frame.to_string());

        let items = frame.as_array().ok_or_else(|| malformed())?;
        let tag = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| malformed())?;

        match tag {
            "connect" | "connected" => decode_handshake(tag, items, malformed),
            "ping" | "pong" | "synced" => {
                if items.len() != 2 {
                    return Err(malformed());
                }
                let synced = items[1].as_u64().ok_or_else(|| malformed())?;
                Ok(match tag {
                    "ping" => Message::Ping(synced),
                    "pong" => Message::Pong(synced),
                    _ => Message::Synced(synced),
                })
            }
            "sync" => {
                if items.len() < 2 || items.len() % 2 != 0 {
                    return Err(malformed());
                }
                let synced = items[1].as_u64().ok_or_else(|| malformed())?;
                let mut entries = Vec::with_capacity((items.len() - 2) / 2);
                for pair in items[2..].chunks(2) {
                    let action: Action =
                        serde_json::from_value(pair[0].clone()).map_err(|_| malformed())?;
                    let meta: Meta =
                        serde_json::from_value(pair[1].clone()).map_err(|_| malformed())?;
                    entries.push((action, meta));
                }
                Ok(Message::Sync { synced, entries })
            }
            "error" => {
                if items.len() < 2 || items.len() > 3 {
                    return Err(malformed());
                }
                let kind_tag = items[1].as_str().ok_or_else(|| malformed())?;
                let kind =
                    ErrorKind::from_wire(kind_tag, items.get(2)).ok_or_else(|| malformed())?;
                Ok(Message::Error(kind))
            }
            "debug" => {
                if items.len() != 3 {
                    return Err(malformed());
                }
                let kind = items[1].as_str().ok_or_else(|| malformed())?;
                Ok(Message::Debug {
                    kind: kind.to_string(),
                    data: items[2].clone(),
                })
            }
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }
}

fn decode_handshake(
    tag: &str,
    items: &[Value],
    malformed: impl Fn() -> DecodeError,
) -> Result<Message, DecodeError> {
    if items.len() < 4 || items.len() > 5 {
        return Err(malformed());
    }
    let protocol: ProtocolVersion =
        serde_json::from_value(items[1].clone()).map_err(|_| malformed())?;
    let node_id = items[2].as_str().ok_or_else(|| malformed())?.to_string();
    let extras = match items.get(4) {
        Some(value) => serde_json::from_value(value.clone()).map_err(|_| malformed())?,
        None => ConnectExtras::default(),
    };

    if tag == "connect" {
        let synced = items[3].as_u64().ok_or_else(|| malformed())?;
        Ok(Message::Connect {
            protocol,
            node_id,
            synced,
            extras,
        })
    } else {
        let timing = items[3].as_array().ok_or_else(|| malformed())?;
        if timing.len() != 2 {
            return Err(malformed());
        }
        let start = timing[0].as_i64().ok_or_else(|| malformed())?;
        let end = timing[1].as_i64().ok_or_else(|| malformed())?;
        Ok(Message::Connected {
            protocol,
            node_id,
            timing: (start, end),
            extras,
        })
    }
}
