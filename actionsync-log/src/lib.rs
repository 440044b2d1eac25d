//! # actionsync-log
//!
//! The append-only action log and its storage contract.
//!
//! A [`Log`] assigns ids to actions, keeps them resident while they carry
//! retention reasons, and emits events that sync nodes and application code
//! subscribe to. Persistence goes through the [`LogStore`] trait;
//! [`MemoryStore`] is the reference implementation used in tests and
//! short-lived processes, persistent backends implement the same contract.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod log;
mod memory;
mod store;

pub use log::{system_time_source, Log, LogError, NewMeta, Subscription, TimeSource};
pub use memory::MemoryStore;
pub use store::{
    LogStore, Order, Page, PageCursor, ReasonCriteria, StoreError, StoreResult, SyncedCursors,
    SyncedUpdate,
};
