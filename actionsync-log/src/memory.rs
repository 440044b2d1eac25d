//! In-memory implementation of the store contract.
//!
//! The reference store for tests and short-lived processes. It has the same
//! observable behavior a persistent backend must provide but keeps
//! everything in process memory; all data is lost on drop.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use actionsync_types::{Action, ActionId, Meta, MetaDiff};

use crate::store::{
    LogStore, Order, Page, PageCursor, ReasonCriteria, StoreResult, SyncedCursors, SyncedUpdate,
};

/// In-memory [`LogStore`]. Thread-safe via `RwLock`; every call sees a
/// consistent snapshot.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Entries ordered by `added`, newest first.
    entries: Vec<(Action, Meta)>,
    /// The last assigned `added` sequence.
    added: u64,
    /// Sync watermarks keyed by peer node id.
    synced: HashMap<String, SyncedCursors>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().entries.is_empty()
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn add(&self, action: Action, mut meta: Meta) -> StoreResult<Option<Meta>> {
        let mut inner = self.inner.write().unwrap();
        if inner.entries.iter().any(|(_, m)| m.id == meta.id) {
            return Ok(None);
        }
        inner.added += 1;
        meta.added = Some(inner.added);
        inner.entries.insert(0, (action, meta.clone()));
        Ok(Some(meta))
    }

    async fn by_id(&self, id: &ActionId) -> StoreResult<Option<(Action, Meta)>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.entries.iter().find(|(_, m)| &m.id == id).cloned())
    }

    async fn has(&self, id: &ActionId) -> StoreResult<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.entries.iter().any(|(_, m)| &m.id == id))
    }

    async fn remove(&self, id: &ActionId) -> StoreResult<Option<(Action, Meta)>> {
        let mut inner = self.inner.write().unwrap();
        match inner.entries.iter().position(|(_, m)| &m.id == id) {
            Some(index) => Ok(Some(inner.entries.remove(index))),
            None => Ok(None),
        }
    }

    async fn change_meta(&self, id: &ActionId, diff: &MetaDiff) -> StoreResult<bool> {
        let mut inner = self.inner.write().unwrap();
        match inner.entries.iter_mut().find(|(_, m)| &m.id == id) {
            Some((_, meta)) => {
                diff.apply(meta);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, order: Order, _page: Option<PageCursor>) -> StoreResult<Page> {
        let inner = self.inner.read().unwrap();
        let mut entries = inner.entries.clone();
        if order == Order::Created {
            entries.sort_by(|(_, a), (_, b)| b.id.cmp(&a.id));
        }
        Ok(Page {
            entries,
            next: None,
        })
    }

    async fn remove_reason(
        &self,
        reason: &str,
        criteria: &ReasonCriteria,
    ) -> StoreResult<Vec<(Action, Meta)>> {
        let mut inner = self.inner.write().unwrap();
        let mut removed = Vec::new();
        inner.entries.retain_mut(|(action, meta)| {
            if !meta.has_reason(reason) || !criteria.matches(meta) {
                return true;
            }
            if meta.reasons.len() == 1 {
                removed.push((action.clone(), meta.clone()));
                false
            } else {
                meta.reasons.retain(|r| r != reason);
                true
            }
        });
        Ok(removed)
    }

    async fn last_added(&self) -> StoreResult<u64> {
        Ok(self.inner.read().unwrap().added)
    }

    async fn get_last_synced(&self, peer: &str) -> StoreResult<SyncedCursors> {
        let inner = self.inner.read().unwrap();
        Ok(inner.synced.get(peer).copied().unwrap_or_default())
    }

    async fn set_last_synced(&self, peer: &str, update: SyncedUpdate) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        let cursors = inner.synced.entry(peer.to_string()).or_default();
        if let Some(sent) = update.sent {
            cursors.sent = sent;
        }
        if let Some(received) = update.received {
            cursors.received = received;
        }
        Ok(())
    }
}
