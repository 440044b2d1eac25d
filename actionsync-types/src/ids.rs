//! Action identifiers and their total order.
//!
//! Every action in a log is identified by a triple of creation time, the id
//! of the node that created it, and a per-millisecond counter. The triple is
//! globally comparable: the order is stable and deterministic, though not
//! wall-clock-accurate across machines with drifting clocks.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A globally comparable identifier for a single action.
///
/// Serialized on the wire as the array `[time, node, counter]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionId {
    /// Creation time in milliseconds since the Unix epoch.
    pub time: i64,
    /// Id of the node that generated this action.
    pub node: String,
    /// Distinguishes actions created on the same node in the same millisecond.
    pub counter: u64,
}

impl ActionId {
    /// Create a new id from its parts.
    pub fn new(time: i64, node: impl Into<String>, counter: u64) -> Self {
        Self {
            time,
            node: node.into(),
            counter,
        }
    }
}

/// Compare two node ids the way the protocol orders them.
///
/// The node id is split at the last `:` into a prefix and a suffix. Prefixes
/// compare lexicographically; suffixes compare numerically when both parse
/// as integers, lexicographically otherwise. Ids without a `:` are treated
/// as all-prefix.
fn compare_nodes(a: &str, b: &str) -> Ordering {
    let (a_prefix, a_suffix) = split_node(a);
    let (b_prefix, b_suffix) = split_node(b);

    match a_prefix.cmp(b_prefix) {
        Ordering::Equal => match (a_suffix.parse::<u64>(), b_suffix.parse::<u64>()) {
            (Ok(a_num), Ok(b_num)) => a_num.cmp(&b_num),
            _ => a_suffix.cmp(b_suffix),
        },
        unequal => unequal,
    }
}

fn split_node(node: &str) -> (&str, &str) {
    match node.rfind(':') {
        Some(at) => (&node[..at], &node[at + 1..]),
        None => (node, ""),
    }
}

impl Ord for ActionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| compare_nodes(&self.node, &other.node))
            .then_with(|| self.counter.cmp(&other.counter))
    }
}

impl PartialOrd for ActionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Return whether `first` was created before `second` under the total order.
///
/// `None` compares as older than everything, so `is_first_older(None,
/// Some(_))` is `true` and `is_first_older(Some(_), None)` is `false`.
pub fn is_first_older(first: Option<&ActionId>, second: Option<&ActionId>) -> bool {
    match (first, second) {
        (Some(a), Some(b)) => a < b,
        (None, Some(_)) => true,
        _ => false,
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.time, self.node, self.counter)
    }
}

/// Error returned when parsing an [`ActionId`] from its string form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid action id: {0}")]
pub struct ParseIdError(pub String);

impl FromStr for ActionId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ' ');
        let (time, node, counter) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(n), Some(c)) => (t, n, c),
            _ => return Err(ParseIdError(s.to_string())),
        };
        let time = time.parse().map_err(|_| ParseIdError(s.to_string()))?;
        let counter = counter.parse().map_err(|_| ParseIdError(s.to_string()))?;
        Ok(ActionId::new(time, node, counter))
    }
}

impl Serialize for ActionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.time)?;
        tuple.serialize_element(&self.node)?;
        tuple.serialize_element(&self.counter)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for ActionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = ActionId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an array of [time, node, counter]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ActionId, A::Error> {
                let time = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let node = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let counter = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                if seq.next_element::<serde_json::Value>()?.is_some() {
                    return Err(de::Error::invalid_length(4, &self));
                }
                Ok(ActionId {
                    time,
                    node,
                    counter,
                })
            }
        }

        deserializer.deserialize_seq(IdVisitor)
    }
}
