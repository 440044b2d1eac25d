//! The append-only action log.
//!
//! A [`Log`] owns one store, assigns ids from its node id and a monotone
//! clock, and emits `before`/`add`/`clean`/`change_meta` events. Handles are
//! cheap to clone and share one underlying log; several sync nodes can
//! observe the same log at once.

use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use thiserror::Error;

use actionsync_types::{Action, ActionId, Meta, MetaDiff};

use crate::store::{LogStore, Order, ReasonCriteria, StoreError};

/// A source of the current time in milliseconds since the Unix epoch.
///
/// Injectable so that tests control id generation and time-fix estimation.
pub type TimeSource = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The default time source, backed by the system clock.
pub fn system_time_source() -> TimeSource {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    })
}

/// Errors raised by [`Log`] operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// The log was created without a node id.
    #[error("log requires a non-empty node id")]
    EmptyNodeId,

    /// The action has an empty `type` discriminator.
    #[error("action is missing a type")]
    MissingActionType,

    /// The diff tried to change a field that is fixed after insertion.
    #[error("meta field `{0}` cannot be changed")]
    ProtectedMeta(&'static str),

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Partial metadata accepted by [`Log::add`].
///
/// Absent fields are filled in by the log: a fresh id, `time` from the id,
/// and an empty reason set.
#[derive(Debug, Clone, Default)]
pub struct NewMeta {
    /// Externally supplied id, e.g. for entries received from a peer.
    pub id: Option<ActionId>,
    /// Creation time override.
    pub time: Option<i64>,
    /// Initial retention reasons.
    pub reasons: Vec<String>,
    /// Additional metadata fields.
    pub extra: Map<String, Value>,
}

impl NewMeta {
    /// Metadata with every field defaulted.
    pub fn fresh() -> Self {
        Self::default()
    }

    /// Set the retention reasons.
    pub fn with_reasons(mut self, reasons: Vec<String>) -> Self {
        self.reasons = reasons;
        self
    }

    /// Set an explicit id.
    pub fn with_id(mut self, id: ActionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set an explicit creation time.
    pub fn with_time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }
}

impl From<Meta> for NewMeta {
    /// Reuse metadata received from a peer. The store-local `added` is
    /// dropped; the receiving store assigns its own.
    fn from(meta: Meta) -> Self {
        Self {
            id: Some(meta.id),
            time: Some(meta.time),
            reasons: meta.reasons,
            extra: meta.extra,
        }
    }
}

type BeforeListener = Box<dyn FnMut(&Action, &mut Meta) + Send>;
type EntryListener = Box<dyn FnMut(&Action, &Meta) + Send>;
type MetaListener = Box<dyn FnMut(&ActionId, &MetaDiff) + Send>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    before: Vec<(u64, BeforeListener)>,
    add: Vec<(u64, EntryListener)>,
    clean: Vec<(u64, EntryListener)>,
    change_meta: Vec<(u64, MetaListener)>,
}

#[derive(Clone, Copy)]
enum EventSlot {
    Before,
    Add,
    Clean,
    ChangeMeta,
}

struct IdClock {
    last_time: i64,
    counter: u64,
}

struct LogShared {
    node_id: String,
    store: Arc<dyn LogStore>,
    clock: Mutex<IdClock>,
    listeners: Mutex<Listeners>,
    time: TimeSource,
}

/// A handle releasing its event listener when dropped.
///
/// Every observer owns the handles it created and drops them on teardown, so
/// log and observer lifetimes stay independent.
#[must_use = "the listener is removed when the subscription is dropped"]
pub struct Subscription {
    shared: Weak<LogShared>,
    slot: EventSlot,
    id: u64,
}

impl Subscription {
    /// Remove the listener now.
    pub fn detach(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut listeners = shared.listeners.lock().unwrap();
            match self.slot {
                EventSlot::Before => listeners.before.retain(|(id, _)| *id != self.id),
                EventSlot::Add => listeners.add.retain(|(id, _)| *id != self.id),
                EventSlot::Clean => listeners.clean.retain(|(id, _)| *id != self.id),
                EventSlot::ChangeMeta => listeners.change_meta.retain(|(id, _)| *id != self.id),
            }
        }
    }
}

/// An append-only, totally ordered log of actions.
#[derive(Clone)]
pub struct Log {
    shared: Arc<LogShared>,
}

impl Log {
    /// Create a log for the given node id over the given store.
    pub fn new(node_id: impl Into<String>, store: impl LogStore + 'static) -> Result<Self, LogError> {
        Self::with_time_source(node_id, store, system_time_source())
    }

    /// Create a log with an explicit time source (used by tests and by
    /// hosts that already keep a virtual clock).
    pub fn with_time_source(
        node_id: impl Into<String>,
        store: impl LogStore + 'static,
        time: TimeSource,
    ) -> Result<Self, LogError> {
        let node_id = node_id.into();
        if node_id.is_empty() {
            return Err(LogError::EmptyNodeId);
        }
        Ok(Self {
            shared: Arc::new(LogShared {
                node_id,
                store: Arc::new(store),
                clock: Mutex::new(IdClock {
                    last_time: 0,
                    counter: 0,
                }),
                listeners: Mutex::new(Listeners::default()),
                time,
            }),
        })
    }

    /// This log's node id.
    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    /// The underlying store.
    pub fn store(&self) -> Arc<dyn LogStore> {
        self.shared.store.clone()
    }

    /// The log's time source.
    pub fn time_source(&self) -> TimeSource {
        self.shared.time.clone()
    }

    /// Generate the next action id.
    ///
    /// Each call returns a strictly greater id, even when the system clock
    /// moves backwards: the previous timestamp is reused and the counter
    /// incremented instead.
    pub fn generate_id(&self) -> ActionId {
        let now = (self.shared.time)();
        let mut clock = self.shared.clock.lock().unwrap();
        if now <= clock.last_time {
            clock.counter += 1;
        } else {
            clock.last_time = now;
            clock.counter = 0;
        }
        ActionId::new(clock.last_time, self.shared.node_id.clone(), clock.counter)
    }

    /// Append an action.
    ///
    /// Fills in absent metadata, emits `before` (listeners may still mutate
    /// the metadata, notably to attach reasons), then stores and emits `add`.
    /// Actions without reasons are only broadcast, never stored. Returns
    /// `None` when an entry with the same id already exists.
    pub async fn add(&self, action: Action, meta: NewMeta) -> Result<Option<Meta>, LogError> {
        if action.kind.is_empty() {
            return Err(LogError::MissingActionType);
        }

        let fresh_id = meta.id.is_none();
        let id = meta.id.unwrap_or_else(|| self.generate_id());
        let mut full = Meta {
            time: meta.time.unwrap_or(id.time),
            id,
            added: None,
            reasons: meta.reasons,
            extra: meta.extra,
        };

        self.emit_before(&action, &mut full);

        if full.reasons.is_empty() {
            if !fresh_id && self.shared.store.has(&full.id).await? {
                return Ok(None);
            }
            tracing::debug!(id = %full.id, kind = %action.kind, "broadcast reasonless action");
            self.emit_add(&action, &full);
            return Ok(Some(full));
        }

        match self.shared.store.add(action.clone(), full).await? {
            Some(stored) => {
                tracing::debug!(id = %stored.id, kind = %action.kind, added = stored.added, "added action");
                self.emit_add(&action, &stored);
                Ok(Some(stored))
            }
            None => Ok(None),
        }
    }

    /// Merge a diff into an entry's metadata.
    ///
    /// Diffs naming `id` or `added` are rejected before reaching the store.
    /// Emits `change_meta` and returns `true` when the entry existed.
    pub async fn change_meta(&self, id: &ActionId, diff: &MetaDiff) -> Result<bool, LogError> {
        if let Some(field) = diff.touches_protected() {
            return Err(LogError::ProtectedMeta(field));
        }
        let changed = self.shared.store.change_meta(id, diff).await?;
        if changed {
            self.emit_change_meta(id, diff);
        }
        Ok(changed)
    }

    /// Drop a retention reason from every entry matching the criteria.
    ///
    /// Entries whose sole reason it was are deleted; `clean` is emitted for
    /// each of them.
    pub async fn remove_reason(
        &self,
        reason: &str,
        criteria: &ReasonCriteria,
    ) -> Result<(), LogError> {
        let removed = self.shared.store.remove_reason(reason, criteria).await?;
        for (action, meta) in &removed {
            tracing::debug!(id = %meta.id, reason, "cleaned action");
            self.emit_clean(action, meta);
        }
        Ok(())
    }

    /// Iterate stored entries page by page. The callback returning `false`
    /// stops the iteration.
    pub async fn each<F>(&self, order: Order, mut callback: F) -> Result<(), LogError>
    where
        F: FnMut(&Action, &Meta) -> bool,
    {
        let mut page = self.shared.store.get(order, None).await?;
        loop {
            for (action, meta) in &page.entries {
                if !callback(action, meta) {
                    return Ok(());
                }
            }
            match page.next {
                Some(cursor) => page = self.shared.store.get(order, Some(cursor)).await?,
                None => return Ok(()),
            }
        }
    }

    /// Collect every stored entry in the given order.
    pub async fn entries(&self, order: Order) -> Result<Vec<(Action, Meta)>, LogError> {
        let mut all = Vec::new();
        self.each(order, |action, meta| {
            all.push((action.clone(), meta.clone()));
            true
        })
        .await?;
        Ok(all)
    }

    /// Listen for `before`: runs synchronously inside `add`, before the
    /// entry reaches the store, and may mutate the metadata.
    pub fn on_before(
        &self,
        listener: impl FnMut(&Action, &mut Meta) + Send + 'static,
    ) -> Subscription {
        let mut listeners = self.shared.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.before.push((id, Box::new(listener)));
        self.subscription(EventSlot::Before, id)
    }

    /// Listen for `add`: every appended (or broadcast) action.
    pub fn on_add(&self, listener: impl FnMut(&Action, &Meta) + Send + 'static) -> Subscription {
        let mut listeners = self.shared.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.add.push((id, Box::new(listener)));
        self.subscription(EventSlot::Add, id)
    }

    /// Listen for `clean`: actions removed because their last reason is gone.
    pub fn on_clean(&self, listener: impl FnMut(&Action, &Meta) + Send + 'static) -> Subscription {
        let mut listeners = self.shared.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.clean.push((id, Box::new(listener)));
        self.subscription(EventSlot::Clean, id)
    }

    /// Listen for `change_meta`: successful metadata updates.
    pub fn on_change_meta(
        &self,
        listener: impl FnMut(&ActionId, &MetaDiff) + Send + 'static,
    ) -> Subscription {
        let mut listeners = self.shared.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.change_meta.push((id, Box::new(listener)));
        self.subscription(EventSlot::ChangeMeta, id)
    }

    /// Listen for a single `before` event.
    pub fn once_before(
        &self,
        listener: impl FnOnce(&Action, &mut Meta) + Send + 'static,
    ) -> Subscription {
        let mut slot = Some(listener);
        self.on_before(move |action, meta| {
            if let Some(listener) = slot.take() {
                listener(action, meta);
            }
        })
    }

    /// Listen for a single `add` event.
    pub fn once_add(
        &self,
        listener: impl FnOnce(&Action, &Meta) + Send + 'static,
    ) -> Subscription {
        let mut slot = Some(listener);
        self.on_add(move |action, meta| {
            if let Some(listener) = slot.take() {
                listener(action, meta);
            }
        })
    }

    /// Listen for a single `clean` event.
    pub fn once_clean(
        &self,
        listener: impl FnOnce(&Action, &Meta) + Send + 'static,
    ) -> Subscription {
        let mut slot = Some(listener);
        self.on_clean(move |action, meta| {
            if let Some(listener) = slot.take() {
                listener(action, meta);
            }
        })
    }

    /// Listen for a single `change_meta` event.
    pub fn once_change_meta(
        &self,
        listener: impl FnOnce(&ActionId, &MetaDiff) + Send + 'static,
    ) -> Subscription {
        let mut slot = Some(listener);
        self.on_change_meta(move |id, diff| {
            if let Some(listener) = slot.take() {
                listener(id, diff);
            }
        })
    }

    fn subscription(&self, slot: EventSlot, id: u64) -> Subscription {
        Subscription {
            shared: Arc::downgrade(&self.shared),
            slot,
            id,
        }
    }

    fn emit_before(&self, action: &Action, meta: &mut Meta) {
        let mut listeners = self.shared.listeners.lock().unwrap();
        for (_, listener) in listeners.before.iter_mut() {
            listener(action, meta);
        }
    }

    fn emit_add(&self, action: &Action, meta: &Meta) {
        let mut listeners = self.shared.listeners.lock().unwrap();
        for (_, listener) in listeners.add.iter_mut() {
            listener(action, meta);
        }
    }

    fn emit_clean(&self, action: &Action, meta: &Meta) {
        let mut listeners = self.shared.listeners.lock().unwrap();
        for (_, listener) in listeners.clean.iter_mut() {
            listener(action, meta);
        }
    }

    fn emit_change_meta(&self, id: &ActionId, diff: &MetaDiff) {
        let mut listeners = self.shared.listeners.lock().unwrap();
        for (_, listener) in listeners.change_meta.iter_mut() {
            listener(id, diff);
        }
    }
}
