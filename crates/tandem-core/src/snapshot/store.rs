//! Snapshot persistence.
//!
//! Snapshots are keyed by the control-log offset they reflect. Saving the
//! same offset twice overwrites (idempotent).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tandem_types::SnapshotInfo;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SnapshotError;

/// Durable storage for [`SnapshotInfo`] blobs.
#[async_trait]
pub trait SnapshotStore: Send + Sync + std::fmt::Debug {
    /// Store a snapshot under its control offset.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the snapshot could not be persisted.
    async fn save(&self, snapshot: &SnapshotInfo) -> Result<(), SnapshotError>;

    /// Load the snapshot taken at control offset `offset`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the store could not be read.
    async fn load(&self, offset: u64) -> Result<Option<SnapshotInfo>, SnapshotError>;

    /// Load the snapshot with the highest control offset, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the store could not be read.
    async fn latest(&self) -> Result<Option<SnapshotInfo>, SnapshotError>;

    /// Delete all but the newest `keep` snapshots. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the store could not be modified.
    async fn prune(&self, keep: usize) -> Result<usize, SnapshotError>;
}

// =========================================================================
// In-memory store
// =========================================================================

/// In-process store. Share one `Arc` between nodes to model a shared store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<BTreeMap<u64, SnapshotInfo>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub async fn len(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    /// Whether the store holds no snapshots.
    pub async fn is_empty(&self) -> bool {
        self.snapshots.lock().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &SnapshotInfo) -> Result<(), SnapshotError> {
        self.snapshots
            .lock()
            .await
            .insert(snapshot.offset, snapshot.clone());
        Ok(())
    }

    async fn load(&self, offset: u64) -> Result<Option<SnapshotInfo>, SnapshotError> {
        Ok(self.snapshots.lock().await.get(&offset).cloned())
    }

    async fn latest(&self) -> Result<Option<SnapshotInfo>, SnapshotError> {
        Ok(self
            .snapshots
            .lock()
            .await
            .last_key_value()
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn prune(&self, keep: usize) -> Result<usize, SnapshotError> {
        let mut snapshots = self.snapshots.lock().await;
        let mut removed = 0_usize;
        while snapshots.len() > keep {
            if snapshots.pop_first().is_none() {
                break;
            }
            removed = removed.saturating_add(1);
        }
        Ok(removed)
    }
}

// =========================================================================
// Filesystem store
// =========================================================================

const FILE_PREFIX: &str = "snapshot-";
const FILE_SUFFIX: &str = ".json";

/// One JSON file per snapshot in a directory.
///
/// Files are written to a temporary name and renamed into place, so a crash
/// mid-write never leaves a truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the snapshot files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, offset: u64) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{offset:020}{FILE_SUFFIX}"))
    }

    /// Stored offsets in ascending order.
    async fn offsets(&self) -> Result<Vec<u64>, SnapshotError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut offsets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let parsed = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                .and_then(|digits| digits.parse::<u64>().ok());
            if let Some(offset) = parsed {
                offsets.push(offset);
            }
        }
        offsets.sort_unstable();
        Ok(offsets)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &SnapshotInfo) -> Result<(), SnapshotError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec(snapshot)?;
        let target = self.path_for(snapshot.offset);
        let staging = self
            .dir
            .join(format!(".{FILE_PREFIX}{:020}.tmp", snapshot.offset));
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &target).await?;
        debug!(path = %target.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    async fn load(&self, offset: u64) -> Result<Option<SnapshotInfo>, SnapshotError> {
        match tokio::fs::read(self.path_for(offset)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest(&self) -> Result<Option<SnapshotInfo>, SnapshotError> {
        match self.offsets().await?.last() {
            Some(&offset) => self.load(offset).await,
            None => Ok(None),
        }
    }

    async fn prune(&self, keep: usize) -> Result<usize, SnapshotError> {
        let offsets = self.offsets().await?;
        let excess = offsets.len().saturating_sub(keep);
        for &offset in offsets.iter().take(excess) {
            tokio::fs::remove_file(self.path_for(offset)).await?;
        }
        Ok(excess)
    }
}
