//! Shared type definitions for the Tandem replication core.
//!
//! Every crate in the workspace speaks in terms of these types: the broker
//! adapters move [`Record`]s, the leader turns each [`DomainEvent`] into a
//! [`ControlMessage`], replicas rebuild state from those control messages,
//! and snapshots are described by [`SnapshotInfo`] / [`SnapshotPointer`].
//!
//! # Modules
//!
//! - [`messages`] -- Records, domain events, control and result messages
//! - [`role`] -- The [`NodeRole`] state machine states
//! - [`snapshot`] -- Snapshot descriptors and the consumption cursor value

pub mod messages;
pub mod role;
pub mod snapshot;

pub use messages::{ControlMessage, DomainEvent, Record, ResultMessage, SideEffect};
pub use role::NodeRole;
pub use snapshot::{CursorPosition, SnapshotInfo, SnapshotPointer};

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// All timestamps carried on the wire use this representation.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
