//! Replication core for the Tandem high-availability engine.
//!
//! One leader evaluates input events against a stateful [`Session`] and
//! records the resulting side effects as control messages. Replicas consume
//! the same events and apply the recorded side effects, so their session
//! state matches the leader's without re-evaluation. A replica can be
//! promoted once it has caught up on the control log.
//!
//! # Modules
//!
//! - [`controller`] -- Events and control poll loops, role-dependent dispatch
//! - [`leadership`] -- The role state machine and its signal handle
//! - [`snapshot`] -- Snapshot stores and the snapshot coordinator
//! - [`session`] -- The [`Session`] seam and the reference [`KvSession`]
//! - [`cursor`] -- The consumption cursor
//! - [`role`] -- Atomic role cell
//! - [`error`] -- Error types

pub mod controller;
pub mod cursor;
pub mod error;
pub mod leadership;
pub mod role;
pub mod session;
pub mod snapshot;

pub use controller::{ConsumerController, ControllerSettings};
pub use cursor::ConsumptionCursor;
pub use error::{ControllerError, SessionError, SnapshotError, TransitionError};
pub use leadership::{LeadershipHandle, LeadershipMonitor, RoleSignal, TransitionHandler};
pub use role::RoleCell;
pub use session::{KV_WRITE, KvEntry, KvSession, Session, SharedSession, shared};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotCoordinator, SnapshotStore};
