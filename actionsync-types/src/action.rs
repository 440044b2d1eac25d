//! Actions and their per-log metadata.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ActionId;

/// An application-level event to be synchronized.
///
/// The runtime only interprets the `type` discriminator; the rest of the
/// payload is carried through opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// The application-defined discriminator. Must be non-empty.
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary payload fields, untouched by the runtime.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Action {
    /// Create an action with the given type and no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Add a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Metadata attached to every action in a log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// The action's globally comparable identifier.
    pub id: ActionId,
    /// Creation time in milliseconds. Defaults to `id.time`; peers shift it
    /// by their time fix so it lies on the local clock.
    pub time: i64,
    /// Sequence number assigned by the store on persistence. Absent for
    /// actions that were never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<u64>,
    /// Retention tags. An action stays in the store while it has at least
    /// one reason; removing the last reason deletes it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    /// Arbitrary additional metadata, carried through transparently.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    /// Create metadata for the given id with `time` defaulted from it.
    pub fn new(id: ActionId) -> Self {
        let time = id.time;
        Self {
            id,
            time,
            added: None,
            reasons: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Whether this metadata carries the given retention reason.
    pub fn has_reason(&self, reason: &str) -> bool {
        self.reasons.iter().any(|r| r == reason)
    }
}

/// A partial update merged into an existing [`Meta`] by `change_meta`.
///
/// The `id` and `added` fields are never updatable; diffs naming them in
/// [`extra`](MetaDiff::extra) are rejected before reaching the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaDiff {
    /// Replacement creation time.
    pub time: Option<i64>,
    /// Replacement reason set.
    pub reasons: Option<Vec<String>>,
    /// Additional metadata fields to set or overwrite.
    pub extra: Map<String, Value>,
}

impl MetaDiff {
    /// Create an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the reason set.
    pub fn with_reasons(mut self, reasons: Vec<String>) -> Self {
        self.reasons = Some(reasons);
        self
    }

    /// Replace the creation time.
    pub fn with_time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    /// Set an additional metadata field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Whether the diff names a field that can never be changed.
    pub fn touches_protected(&self) -> Option<&'static str> {
        if self.extra.contains_key("id") {
            Some("id")
        } else if self.extra.contains_key("added") {
            Some("added")
        } else {
            None
        }
    }

    /// Merge this diff into the given metadata.
    pub fn apply(&self, meta: &mut Meta) {
        if let Some(time) = self.time {
            meta.time = time;
        }
        if let Some(reasons) = &self.reasons {
            meta.reasons = reasons.clone();
        }
        for (key, value) in &self.extra {
            meta.extra.insert(key.clone(), value.clone());
        }
    }
}
