//! # actionsync-types
//!
//! Wire format types for the actionsync log synchronization protocol.
//!
//! This crate provides the foundational types used across all actionsync
//! crates:
//! - [`ActionId`] and [`is_first_older`] - globally comparable action
//!   identifiers with a total order
//! - [`Action`], [`Meta`], [`MetaDiff`] - log entries and their metadata
//! - [`Message`] - protocol messages (connect, sync, ping, ...) and their
//!   array-framed wire codec
//! - [`SyncError`], [`ErrorKind`] - the protocol error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod action;
mod error;
mod ids;
mod messages;

pub use action::{Action, Meta, MetaDiff};
pub use error::{ErrorKind, SyncError};
pub use ids::{is_first_older, ActionId, ParseIdError};
pub use messages::{ConnectExtras, DecodeError, Frame, Message, ProtocolVersion};
