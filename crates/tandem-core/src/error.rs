//! Error types for the replication core.
//!
//! Each subsystem has its own enum so callers can tell a recoverable
//! snapshot failure from a fatal replica divergence at the type level.

use std::time::Duration;

use tandem_broker::BrokerError;

/// Errors raised by a [`Session`](crate::session::Session) implementation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The event cannot be evaluated (malformed or unsupported body).
    #[error("invalid event {id}: {reason}")]
    InvalidEvent {
        /// Id of the rejected event.
        id: String,
        /// Why the session rejected it.
        reason: String,
    },

    /// Recorded side effects could not be applied.
    #[error("cannot apply recorded side effects for event {id}: {reason}")]
    RejectedEffects {
        /// Id of the event the effects belong to.
        id: String,
        /// Why the session rejected them.
        reason: String,
    },

    /// A snapshot payload could not be restored.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// Serialization or deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised while taking, storing, or restoring snapshots.
///
/// All of these are recoverable: snapshotting only shortens recovery.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Snapshot store I/O failed.
    #[error("snapshot store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or pointer (de)serialization failed.
    #[error("snapshot serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The session could not produce or accept a snapshot payload.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Publishing or reading the snapshot pointer failed.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The session stayed locked (a leader emission is retrying) for the
    /// whole capture timeout.
    #[error("session busy; not captured within {waited:?}")]
    Busy {
        /// How long the capture waited for the session lock.
        waited: Duration,
    },

    /// The session holds an applied event the cursor does not account for,
    /// so no snapshot of it may be taken.
    #[error("session state is ahead of the cursor: {0}")]
    Inconsistent(String),
}

/// Errors raised by the consumer controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// A replica could not apply the leader's recorded side effects.
    ///
    /// This means leader and replica state diverged; consumption halts.
    #[error("replica divergence at control offset {offset} (event {event_id}): {reason}")]
    Divergence {
        /// Id of the event being applied.
        event_id: String,
        /// Control-log offset of the rejected message.
        offset: u64,
        /// The session's rejection.
        reason: String,
    },

    /// A leader emission failed with an error retrying cannot fix.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The controller was already started.
    #[error("controller already started")]
    AlreadyStarted,

    /// A poll loop task panicked or was cancelled.
    #[error("poll loop task failed: {0}")]
    Join(String),
}

/// Errors raised by a role transition.
///
/// A failed transition leaves the node in its pre-transition role.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// The control log end offset could not be read at promotion time.
    #[error("cannot read control log end offset: {0}")]
    Broker(#[from] BrokerError),

    /// The callback gave up before completing (e.g. stop was requested).
    #[error("transition aborted: {0}")]
    Aborted(String),

    /// The controller halted on a divergence and cannot change role.
    #[error("controller is faulted: {0}")]
    Faulted(String),

    /// The monitor task is no longer running.
    #[error("leadership monitor is not running: {0}")]
    MonitorClosed(String),
}
