//! Migration batch journal.
//!
//! Every status transition of a [`MigrationBatch`] is recorded before the
//! engine moves on, so a restarted process knows which step to resume from.
//! Finished batches (`removed-from-primary` or `failed`) are pruned.

use crate::Result;
use async_trait::async_trait;
use larder_types::{Collection, RecordId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Progress of a migration batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchStatus {
    /// Selected; archive writes in progress.
    Pending,
    /// Every record confirmed resident in the archive.
    WrittenToArchive,
    /// Every record removed from primary. Terminal.
    RemovedFromPrimary,
    /// Abandoned before any primary delete. Terminal.
    Failed,
}

impl BatchStatus {
    /// Returns true if no further work is attached to the batch.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::RemovedFromPrimary | BatchStatus::Failed)
    }
}

/// An ordered set of records moved from primary to archive as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationBatch {
    /// Batch identifier.
    pub id: Uuid,
    /// Collection the records belong to.
    pub collection: Collection,
    /// Records in the batch, oldest first.
    pub record_ids: Vec<RecordId>,
    /// Current status.
    pub status: BatchStatus,
    /// When the batch was selected.
    pub created_at: Timestamp,
    /// When the status last changed.
    pub updated_at: Timestamp,
}

impl MigrationBatch {
    /// Creates a pending batch.
    #[must_use]
    pub fn new(collection: Collection, record_ids: Vec<RecordId>) -> Self {
        let now = Timestamp::now();
        Self {
            id: Uuid::new_v4(),
            collection,
            record_ids,
            status: BatchStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the batch to `status`.
    pub fn advance(&mut self, status: BatchStatus) {
        self.status = status;
        self.updated_at = Timestamp::now();
    }
}

/// Durable record of in-flight migration batches.
#[async_trait]
pub trait BatchJournal: Send + Sync {
    /// Records the batch's current status. Terminal batches are pruned.
    async fn record(&self, batch: &MigrationBatch) -> Result<()>;

    /// Returns every batch that has not reached a terminal status.
    async fn incomplete(&self) -> Result<Vec<MigrationBatch>>;
}

/// Journal kept in memory; does not survive restarts.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    batches: RwLock<HashMap<Uuid, MigrationBatch>>,
}

impl MemoryJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchJournal for MemoryJournal {
    async fn record(&self, batch: &MigrationBatch) -> Result<()> {
        let mut batches = self.batches.write();
        if batch.status.is_terminal() {
            batches.remove(&batch.id);
        } else {
            batches.insert(batch.id, batch.clone());
        }
        Ok(())
    }

    async fn incomplete(&self) -> Result<Vec<MigrationBatch>> {
        let mut batches: Vec<_> = self.batches.read().values().cloned().collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }
}

/// Journal persisted as a JSON file, rewritten atomically on every change.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    batches: Mutex<HashMap<Uuid, MigrationBatch>>,
}

impl FileJournal {
    /// Opens the journal at `path`, loading any batches already recorded.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let batches = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let saved: Vec<MigrationBatch> = serde_json::from_slice(&bytes)?;
                saved.into_iter().map(|b| (b.id, b)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            batches: Mutex::new(batches),
        })
    }
}

#[async_trait]
impl BatchJournal for FileJournal {
    async fn record(&self, batch: &MigrationBatch) -> Result<()> {
        let mut batches = self.batches.lock().await;
        if batch.status.is_terminal() {
            batches.remove(&batch.id);
        } else {
            batches.insert(batch.id, batch.clone());
        }

        let saved: Vec<&MigrationBatch> = batches.values().collect();
        let bytes = serde_json::to_vec_pretty(&saved)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn incomplete(&self) -> Result<Vec<MigrationBatch>> {
        let mut batches: Vec<_> = self.batches.lock().await.values().cloned().collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminal_batches_are_pruned() {
        let journal = MemoryJournal::new();
        let mut batch = MigrationBatch::new(Collection::Orders, vec!["a".into()]);

        journal.record(&batch).await.unwrap();
        assert_eq!(journal.incomplete().await.unwrap().len(), 1);

        batch.advance(BatchStatus::RemovedFromPrimary);
        journal.record(&batch).await.unwrap();
        assert!(journal.incomplete().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");

        let mut batch = MigrationBatch::new(Collection::Users, vec!["u1".into(), "u2".into()]);
        batch.advance(BatchStatus::WrittenToArchive);
        {
            let journal = FileJournal::open(&path).await.unwrap();
            journal.record(&batch).await.unwrap();
        }

        let reopened = FileJournal::open(&path).await.unwrap();
        let incomplete = reopened.incomplete().await.unwrap();
        assert_eq!(incomplete, vec![batch]);
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&BatchStatus::WrittenToArchive).unwrap();
        assert_eq!(json, "\"written-to-archive\"");
    }
}
