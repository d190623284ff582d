//! Snapshot storage and coordination.
//!
//! - [`store`] -- The [`SnapshotStore`] trait with in-memory and file backends
//! - [`coordinator`] -- Capture, announce, and restore

pub mod coordinator;
pub mod store;

pub use coordinator::SnapshotCoordinator;
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
