//! Snapshot descriptors and cursor positions.

use serde::{Deserialize, Serialize};

/// A point-in-time capture of session state.
///
/// `offset` is the last control-log offset reflected in `payload`;
/// `events_offset` is the last events-topic offset reflected. A node that
/// restores this snapshot resumes the control log at `offset + 1` and the
/// events topic at `events_offset + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Last control-log offset included.
    pub offset: u64,
    /// Last events-topic offset included.
    #[serde(default)]
    pub events_offset: u64,
    /// Capture time in epoch milliseconds.
    pub timestamp: i64,
    /// Session-serialized state.
    pub payload: Vec<u8>,
}

impl SnapshotInfo {
    /// The pointer record published for this snapshot.
    pub const fn pointer(&self) -> SnapshotPointer {
        SnapshotPointer {
            offset: self.offset,
            events_offset: self.events_offset,
            timestamp: self.timestamp,
        }
    }

    /// The cursor position a restoring node starts from.
    pub const fn position(&self) -> CursorPosition {
        CursorPosition {
            events: self.events_offset,
            control: self.offset,
        }
    }
}

/// Record published to the snapshot topic announcing a new snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPointer {
    /// Control-log offset of the snapshot (its store key).
    pub offset: u64,
    /// Events-topic offset of the snapshot.
    #[serde(default)]
    pub events_offset: u64,
    /// Capture time in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// Last committed offsets per topic (the consumption cursor value).
///
/// Both fields start at 0, meaning "nothing consumed".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// Last applied events-topic offset.
    pub events: u64,
    /// Last applied control-log offset.
    pub control: u64,
}
