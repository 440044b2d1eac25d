//! The store contract: async persistence behind a [`Log`](crate::Log).
//!
//! A store is a logical mapping from action id to `(action, meta)` with a
//! monotonically increasing `added` sequence assigned on insertion, paginated
//! iteration in two orders, and per-peer sync cursors. The trait is
//! deliberately narrow so that an in-memory store and a persistent one are
//! interchangeable with identical observable behavior.

use async_trait::async_trait;
use thiserror::Error;

use actionsync_types::{is_first_older, Action, ActionId, Meta, MetaDiff};

/// Errors reported by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed to read or write.
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Iteration order for [`LogStore::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Descending by the store-assigned `added` sequence (default).
    #[default]
    Added,
    /// Descending by action id under the protocol's total order.
    Created,
}

/// An opaque continuation token for paginated [`LogStore::get`] calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor(pub u64);

/// One page of log entries.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// The `(action, meta)` pairs of this page.
    pub entries: Vec<(Action, Meta)>,
    /// Token for the next page, or `None` when this page is the last.
    pub next: Option<PageCursor>,
}

/// Per-peer sync watermarks in `added` space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncedCursors {
    /// Highest local `added` acknowledged by the peer.
    pub sent: u64,
    /// Highest remote `added` processed locally.
    pub received: u64,
}

/// Partial update for [`LogStore::set_last_synced`]. Absent fields keep
/// their stored value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncedUpdate {
    /// New `sent` watermark.
    pub sent: Option<u64>,
    /// New `received` watermark.
    pub received: Option<u64>,
}

impl SyncedUpdate {
    /// Update only the `sent` watermark.
    pub fn sent(value: u64) -> Self {
        Self {
            sent: Some(value),
            received: None,
        }
    }

    /// Update only the `received` watermark.
    pub fn received(value: u64) -> Self {
        Self {
            sent: None,
            received: Some(value),
        }
    }
}

/// Filters for [`LogStore::remove_reason`]. Empty criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct ReasonCriteria {
    /// Only entries with `added >= min_added`.
    pub min_added: Option<u64>,
    /// Only entries with `added <= max_added`.
    pub max_added: Option<u64>,
    /// Only entries whose id is older than this bound.
    pub older_than: Option<ActionId>,
    /// Only entries whose id is younger than this bound.
    pub younger_than: Option<ActionId>,
}

impl ReasonCriteria {
    /// Whether the given metadata passes every configured filter.
    pub fn matches(&self, meta: &Meta) -> bool {
        if let Some(min) = self.min_added {
            if meta.added.map_or(true, |added| added < min) {
                return false;
            }
        }
        if let Some(max) = self.max_added {
            if meta.added.map_or(true, |added| added > max) {
                return false;
            }
        }
        if let Some(bound) = &self.older_than {
            if !is_first_older(Some(&meta.id), Some(bound)) {
                return false;
            }
        }
        if let Some(bound) = &self.younger_than {
            if !is_first_older(Some(bound), Some(&meta.id)) {
                return false;
            }
        }
        true
    }
}

/// Async persistence contract consumed by [`Log`](crate::Log).
///
/// Implementations must tolerate interleaved calls; the reference
/// [`MemoryStore`](crate::MemoryStore) serializes them in call order.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert an entry. Assigns the next `added` sequence and returns the
    /// stored metadata, or `None` when the id is already present.
    async fn add(&self, action: Action, meta: Meta) -> StoreResult<Option<Meta>>;

    /// Look up an entry by id.
    async fn by_id(&self, id: &ActionId) -> StoreResult<Option<(Action, Meta)>>;

    /// Whether an entry with the given id is stored.
    async fn has(&self, id: &ActionId) -> StoreResult<bool>;

    /// Delete an entry, returning it when it existed.
    async fn remove(&self, id: &ActionId) -> StoreResult<Option<(Action, Meta)>>;

    /// Merge a diff into an entry's metadata. `false` on unknown id.
    async fn change_meta(&self, id: &ActionId, diff: &MetaDiff) -> StoreResult<bool>;

    /// Read one page of entries in the given order. Pass the previous page's
    /// `next` token to continue; `None` starts from the beginning.
    async fn get(&self, order: Order, page: Option<PageCursor>) -> StoreResult<Page>;

    /// Drop a retention reason from every matching entry. Entries whose sole
    /// reason it was are deleted and returned; entries with further reasons
    /// keep the rest.
    async fn remove_reason(
        &self,
        reason: &str,
        criteria: &ReasonCriteria,
    ) -> StoreResult<Vec<(Action, Meta)>>;

    /// The highest `added` sequence assigned so far, `0` when empty.
    async fn last_added(&self) -> StoreResult<u64>;

    /// Read the sync watermarks for a peer. Zeroes for unknown peers.
    async fn get_last_synced(&self, peer: &str) -> StoreResult<SyncedCursors>;

    /// Merge new sync watermarks for a peer.
    async fn set_last_synced(&self, peer: &str, update: SyncedUpdate) -> StoreResult<()>;
}
