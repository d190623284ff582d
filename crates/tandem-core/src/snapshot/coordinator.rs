//! Taking and restoring session snapshots.
//!
//! A snapshot is captured under the session mutex together with the cursor
//! position, stored in a [`SnapshotStore`], and announced by publishing a
//! [`SnapshotPointer`] to the snapshot topic. On startup a node reads the
//! latest pointer (bounded wait), loads the snapshot, restores the session,
//! and resumes consumption right after the recorded offsets.
//!
//! Capture waits at most a bounded time for the session lock, and a
//! coordinator that has been [invalidated](SnapshotCoordinator::invalidate)
//! refuses to capture at all.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tandem_broker::{Producer, last_record_within};
use tandem_types::{SnapshotInfo, SnapshotPointer};
use tracing::{info, warn};

use crate::cursor::ConsumptionCursor;
use crate::error::SnapshotError;
use crate::session::SharedSession;
use crate::snapshot::store::SnapshotStore;

/// Key the snapshot pointer is published under.
const POINTER_KEY: &str = "snapshot";

/// Default bound on waiting for the session lock during capture.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Captures, stores, announces, and restores snapshots.
#[derive(Debug)]
pub struct SnapshotCoordinator {
    session: SharedSession,
    cursor: ConsumptionCursor,
    store: Arc<dyn SnapshotStore>,
    producer: Producer,
    snapshot_topic: String,
    discovery_timeout: Duration,
    capture_timeout: Duration,
    retain: usize,
    invalidated: OnceLock<String>,
}

impl SnapshotCoordinator {
    /// Create a coordinator.
    ///
    /// `discovery_timeout` bounds the startup lookup of the latest pointer;
    /// `retain` is how many snapshots to keep after each save (0 keeps all).
    pub fn new(
        session: SharedSession,
        cursor: ConsumptionCursor,
        store: Arc<dyn SnapshotStore>,
        producer: Producer,
        snapshot_topic: impl Into<String>,
        discovery_timeout: Duration,
        retain: usize,
    ) -> Self {
        Self {
            session,
            cursor,
            store,
            producer,
            snapshot_topic: snapshot_topic.into(),
            discovery_timeout,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            retain,
            invalidated: OnceLock::new(),
        }
    }

    /// Bound the wait for the session lock when capturing.
    #[must_use]
    pub const fn with_capture_timeout(mut self, capture_timeout: Duration) -> Self {
        self.capture_timeout = capture_timeout;
        self
    }

    /// Refuse every further capture. Called with the session lock held when
    /// the session applied an event whose emission was abandoned.
    pub fn invalidate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.invalidated.set(reason.clone()).is_ok() {
            warn!(reason, "snapshots disabled for this session");
        }
    }

    /// Why captures are refused, if they are.
    pub fn invalidated(&self) -> Option<&str> {
        self.invalidated.get().map(String::as_str)
    }

    /// The backing store.
    pub const fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Capture the session now, store it, and publish its pointer.
    ///
    /// Consumption is paused only for the capture itself (the session lock);
    /// storing and publishing happen after the lock is released.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Busy`] if the session lock is not free within
    /// the capture timeout, [`SnapshotError::Inconsistent`] after
    /// [`invalidate`](Self::invalidate), or another [`SnapshotError`] if
    /// serialization, storage, or publishing fails. Callers treat all of
    /// these as recoverable.
    pub async fn snapshot_now(&self) -> Result<SnapshotInfo, SnapshotError> {
        let snapshot = {
            let Ok(session) = tokio::time::timeout(self.capture_timeout, self.session.lock()).await
            else {
                return Err(SnapshotError::Busy {
                    waited: self.capture_timeout,
                });
            };
            if let Some(reason) = self.invalidated() {
                return Err(SnapshotError::Inconsistent(reason.to_owned()));
            }
            let position = self.cursor.position();
            SnapshotInfo {
                offset: position.control,
                events_offset: position.events,
                timestamp: tandem_types::now_millis(),
                payload: session.snapshot()?,
            }
        };

        self.store.save(&snapshot).await?;
        self.producer
            .produce_sync(&self.snapshot_topic, POINTER_KEY, &snapshot.pointer())
            .await?;

        if self.retain > 0 {
            match self.store.prune(self.retain).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, retain = self.retain, "pruned old snapshots"),
                Err(e) => warn!(error = %e, "snapshot prune failed"),
            }
        }

        info!(
            offset = snapshot.offset,
            events_offset = snapshot.events_offset,
            bytes = snapshot.payload.len(),
            "snapshot taken"
        );
        Ok(snapshot)
    }

    /// Restore the session from the latest announced snapshot.
    ///
    /// Returns `Ok(None)` when no snapshot has been announced (start from
    /// offset 0). If the announced snapshot is missing from the local store,
    /// the newest locally stored one is used instead.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the pointer or snapshot cannot be
    /// decoded, the store cannot be read, or the session rejects the payload.
    pub async fn restore(&self) -> Result<Option<SnapshotInfo>, SnapshotError> {
        let broker = self.producer.broker();
        let Some(record) =
            last_record_within(broker.as_ref(), &self.snapshot_topic, self.discovery_timeout).await
        else {
            info!(topic = self.snapshot_topic, "no snapshot announced; starting from offset 0");
            return Ok(None);
        };

        let pointer: SnapshotPointer = serde_json::from_slice(&record.payload)?;
        let snapshot = match self.store.load(pointer.offset).await? {
            Some(snapshot) => snapshot,
            None => {
                warn!(
                    offset = pointer.offset,
                    "announced snapshot not in store; falling back to newest stored"
                );
                let Some(snapshot) = self.store.latest().await? else {
                    return Ok(None);
                };
                snapshot
            }
        };

        self.session.lock().await.restore(&snapshot.payload)?;
        self.cursor.set(snapshot.position());

        info!(
            offset = snapshot.offset,
            events_offset = snapshot.events_offset,
            "session restored from snapshot"
        );
        Ok(Some(snapshot))
    }
}
