//! The [`Event`] data model shared by the recorder, replayer, analyser, and
//! assertion suite.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A nanosecond offset from a single session's monotonic clock origin.
///
/// All latency/ordering arithmetic uses this type, never `wall_time`
/// directly, per the design rule against mixing clock sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonotonicInstant(pub u64);

impl MonotonicInstant {
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn duration_since(self, earlier: MonotonicInstant) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

/// The kind of a recorded event, matching `spec.md` §3 exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connect,
    Login,
    MessageSend,
    MessageReceive,
    Heartbeat,
    Reconnect,
    Error,
    Close,
}

/// A dynamically-typed attribute value. A keyed document representation was
/// chosen over a typed sum-of-variants per `spec.md` §9 ("Session event
/// attributes"), since events carry heterogeneous fields depending on kind
/// (opcode, sequence number, latency, reason code, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_owned())
    }
}
impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}
impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::I64(v)
    }
}
impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::U64(v)
    }
}
impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::F64(v)
    }
}
impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl AttrValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::U64(v) => Some(*v),
            AttrValue::I64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::F64(v) => Some(*v),
            AttrValue::I64(v) => Some(*v as f64),
            AttrValue::U64(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// One recorded event. Events are totally ordered by `(at, insertion
/// order)`; the `seq` field (assigned by the recorder, not user-settable)
/// carries that insertion order so ties on `at` stay stable under replay
/// and export/import round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub kind: EventKind,
    pub at: MonotonicInstant,
    pub wall_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Event {
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }
}

/// Well-known attribute keys, to keep producers/consumers in sync without
/// stringly-typed drift.
pub mod attr_keys {
    pub const OPCODE: &str = "opcode";
    pub const SEQUENCE_NUMBER: &str = "sequence_number";
    pub const LATENCY_NANOS: &str = "latency_nanos";
    pub const REASON_CODE: &str = "reason_code";
    pub const DESCRIPTION: &str = "description";
    pub const DEDUP: &str = "dedup";
    pub const UNSOLICITED: &str = "unsolicited";
}
