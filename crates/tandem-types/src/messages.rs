//! Wire-level message types.
//!
//! The control topic carries one [`ControlMessage`] per event the leader
//! evaluated. It is the only thing a replica needs to reconstruct state; it
//! never depends on any other field of the original [`DomainEvent`].

use serde::{Deserialize, Serialize};

/// A single record as returned by a broker poll.
///
/// Offsets start at 1 and are strictly increasing within a topic. Offset 0
/// is reserved to mean "nothing consumed yet".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic the record was read from.
    pub topic: String,
    /// Log-assigned offset.
    pub offset: u64,
    /// Partitioning key the producer attached, if any.
    pub key: Option<String>,
    /// Producer-side timestamp in epoch milliseconds (0 if unknown).
    pub timestamp: i64,
    /// Raw message body.
    pub payload: Vec<u8>,
}

/// An opaque side effect computed by the session while evaluating an event.
///
/// The core never interprets side effects; it only records them on the
/// leader and hands them back to the session on replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffect {
    /// Session-defined discriminator (e.g. `"set"`, `"fire"`).
    pub kind: String,
    /// Session-defined body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SideEffect {
    /// Build a side effect from a kind and a JSON payload.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// An input event read from the events topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event identifier. Control messages refer back to it.
    pub id: String,
    /// Partitioning key.
    #[serde(default)]
    pub key: String,
    /// Upstream timestamp in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Session-defined body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DomainEvent {
    /// Decode an event from a raw broker record.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload is not a valid event.
    pub fn from_record(record: &Record) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(&record.payload)
    }
}

/// The replication record emitted by the leader for every evaluated event.
///
/// `Default` is the zero-valued record (`offset = 0`, no id, `timestamp = 0`,
/// no side effects), which is what "empty topic" lookups return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Log-assigned offset. Always 0 on the wire; filled in on decode.
    #[serde(default)]
    pub offset: u64,
    /// Id of the event this message summarizes.
    #[serde(default)]
    pub id: Option<String>,
    /// Leader-side timestamp in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Side effects the leader computed for the event.
    #[serde(default)]
    pub side_effects: Option<Vec<SideEffect>>,
}

impl ControlMessage {
    /// Build an outgoing control message for an evaluated event.
    ///
    /// The offset is left at 0; the log assigns the real one.
    pub fn for_event(event_id: &str, side_effects: Vec<SideEffect>, timestamp: i64) -> Self {
        Self {
            offset: 0,
            id: Some(event_id.to_owned()),
            timestamp,
            side_effects: Some(side_effects),
        }
    }

    /// Decode a control message from a raw record, taking the offset from
    /// the record rather than from the payload.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload is not a control message.
    pub fn from_record(record: &Record) -> Result<Self, serde_json::Error> {
        let mut message: Self = serde_json::from_slice(&record.payload)?;
        message.offset = record.offset;
        Ok(message)
    }

    /// Whether this is the zero-valued "nothing there" record.
    pub const fn is_empty(&self) -> bool {
        self.offset == 0 && self.id.is_none() && self.timestamp == 0 && self.side_effects.is_none()
    }

    /// Whether `other` is another copy of the same emission: same event id,
    /// leader timestamp, and side effects. Offsets are ignored.
    pub fn same_emission(&self, other: &Self) -> bool {
        self.id == other.id
            && self.timestamp == other.timestamp
            && self.side_effects == other.side_effects
    }

    /// Side effects as a slice (empty when none were recorded).
    pub fn effects(&self) -> &[SideEffect] {
        self.side_effects.as_deref().unwrap_or_default()
    }
}

/// Published by the leader to the optional results topic after each event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Id of the evaluated event.
    pub event_id: String,
    /// Control-log offset of the matching control message.
    pub offset: u64,
    /// Side effects produced by the evaluation.
    pub side_effects: Vec<SideEffect>,
}
