//! Migration engine.
//!
//! Moves batches of the oldest primary records into the archive:
//!
//! 1. select the oldest records and journal the batch as `pending`
//! 2. write each record to the archive and read it back to confirm it
//! 3. journal the batch as `written-to-archive`
//! 4. delete each record from primary, then journal `removed-from-primary`
//!
//! A record is never deleted from primary before the archive has confirmed
//! it, so at every instant each record is readable from at least one tier.
//! Batches found `written-to-archive` after a restart resume at step 4.

use crate::adapter::{ConditionalDelete, ListQuery, StoreAdapter, Tier};
use crate::config::MigrationConfig;
use crate::journal::{BatchJournal, BatchStatus, MigrationBatch};
use crate::resilience::{CallPolicy, RetryPolicy};
use crate::{Result, StorageError};
use futures::future::join_all;
use larder_types::{Collection, Record, RecordId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of one migration batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Batch identifier.
    pub batch_id: Uuid,
    /// Collection migrated.
    pub collection: Collection,
    /// Records selected for the batch.
    pub selected: usize,
    /// Records removed from primary.
    pub moved: usize,
    /// Final status of the batch.
    pub status: BatchStatus,
    /// The batch was picked up from the journal after a restart.
    pub resumed: bool,
}

/// Moves records from the primary tier to the archive tier.
pub struct MigrationEngine {
    primary: Arc<dyn StoreAdapter>,
    archive: Arc<dyn StoreAdapter>,
    journal: Arc<dyn BatchJournal>,
    primary_calls: CallPolicy,
    archive_calls: CallPolicy,
    config: MigrationConfig,
}

/// Times a record may change under a pending delete before the batch gives
/// up on it and leaves it for resumption.
const MAX_REARCHIVE_ROUNDS: usize = 8;

/// What happened to one record in the delete phase.
enum Removal {
    Removed,
    /// The primary copy was already gone.
    Absent,
}

impl MigrationEngine {
    /// Creates an engine over the two tiers.
    pub fn new(
        primary: Arc<dyn StoreAdapter>,
        archive: Arc<dyn StoreAdapter>,
        journal: Arc<dyn BatchJournal>,
        primary_calls: CallPolicy,
        archive_calls: CallPolicy,
        config: MigrationConfig,
    ) -> Self {
        Self {
            primary,
            archive,
            journal,
            primary_calls,
            archive_calls,
            config,
        }
    }

    /// Largest batch the engine will run.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    /// Runs one batch of at most `size` (capped at `max_batch_size`) of the
    /// oldest records in `collection`.
    ///
    /// Returns `None` when primary holds nothing to migrate.
    pub async fn run_batch(
        &self,
        collection: Collection,
        size: usize,
    ) -> Result<Option<MigrationReport>> {
        let size = size.clamp(1, self.config.max_batch_size);
        let query = ListQuery::scan(size);
        let page = self
            .primary_calls
            .call("select_oldest", || self.primary.list(collection, &query))
            .await?;
        if page.records.is_empty() {
            return Ok(None);
        }

        let records = page.records;
        let mut batch = MigrationBatch::new(collection, records.iter().map(|r| r.id.clone()).collect());
        self.journal.record(&batch).await?;

        tracing::info!(
            batch_id = %batch.id,
            %collection,
            size = records.len(),
            "Starting migration batch"
        );

        self.migrate_records(&mut batch, &records).await.map(Some)
    }

    async fn migrate_records(
        &self,
        batch: &mut MigrationBatch,
        records: &[Record],
    ) -> Result<MigrationReport> {
        if let Err(e) = self.archive_all(batch.collection, records).await {
            batch.advance(BatchStatus::Failed);
            self.journal.record(batch).await?;
            tracing::warn!(
                batch_id = %batch.id,
                collection = %batch.collection,
                error = %e,
                "Migration batch failed during archive writes; primary untouched"
            );
            return Err(e);
        }

        batch.advance(BatchStatus::WrittenToArchive);
        self.journal.record(batch).await?;

        let archived: HashMap<&RecordId, &Record> = records.iter().map(|r| (&r.id, r)).collect();
        self.remove_from_primary(batch, &archived, false).await
    }

    /// Writes and confirms every record, retrying the unconfirmed subset
    /// with backoff.
    async fn archive_all(&self, collection: Collection, records: &[Record]) -> Result<()> {
        let retry: &RetryPolicy = &self.archive_calls.retry;
        let mut pending: Vec<&Record> = records.iter().collect();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcomes = join_all(
                pending
                    .iter()
                    .map(|record| self.write_confirmed(collection, record)),
            )
            .await;

            let mut last_error = None;
            let mut still_pending = Vec::new();
            for (record, outcome) in pending.into_iter().zip(outcomes) {
                if let Err(e) = outcome {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = Some(e);
                    still_pending.push(record);
                }
            }

            if still_pending.is_empty() {
                return Ok(());
            }
            if attempt >= retry.max_attempts {
                let confirmed = records.len() - still_pending.len();
                return Err(StorageError::unavailable(
                    Tier::Archive,
                    format!(
                        "{confirmed} of {} records confirmed; last error: {}",
                        records.len(),
                        last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string())
                    ),
                ));
            }

            tracing::debug!(
                %collection,
                attempt,
                unconfirmed = still_pending.len(),
                "Retrying unconfirmed archive writes"
            );
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            pending = still_pending;
        }
    }

    /// Writes one record to the archive and reads it back.
    async fn write_confirmed(&self, collection: Collection, record: &Record) -> Result<()> {
        self.archive_calls
            .call_once(self.archive.put(collection, record))
            .await?;
        let stored = self
            .archive_calls
            .call_once(self.archive.get(collection, &record.id))
            .await?;
        if stored.as_ref() != Some(record) {
            return Err(StorageError::unavailable(
                Tier::Archive,
                format!("write of {} not confirmed by read-back", record.id),
            ));
        }
        Ok(())
    }

    /// Deletes the batch's records from primary.
    ///
    /// A primary copy that changed since it was archived is re-archived
    /// first. A primary copy that vanished during a live batch was deleted
    /// by a caller, so its archived copy is dropped too; after a restart the
    /// engine itself may have removed it, so the archived copy is kept.
    async fn remove_from_primary(
        &self,
        batch: &mut MigrationBatch,
        archived: &HashMap<&RecordId, &Record>,
        resumed: bool,
    ) -> Result<MigrationReport> {
        let collection = batch.collection;
        let mut moved = 0;
        let mut failures = 0;

        for id in &batch.record_ids {
            match self.remove_one(collection, id, archived.get(id).copied()).await {
                Ok(Removal::Removed) => moved += 1,
                Ok(Removal::Absent) if resumed => {}
                Ok(Removal::Absent) => {
                    tracing::debug!(%collection, %id, "Record deleted during migration, dropping archived copy");
                    if let Err(e) = self
                        .archive_calls
                        .call("drop_deleted", || self.archive.delete(collection, id))
                        .await
                    {
                        failures += 1;
                        tracing::warn!(%collection, %id, error = %e, "Failed to drop archived copy of deleted record");
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(%collection, %id, error = %e, "Primary delete failed; batch will resume");
                }
            }
        }

        if failures > 0 {
            return Err(StorageError::MigrationIncomplete {
                batch_id: batch.id,
                status: batch.status,
            });
        }

        batch.advance(BatchStatus::RemovedFromPrimary);
        self.journal.record(batch).await?;

        tracing::info!(batch_id = %batch.id, %collection, moved, resumed, "Migration batch complete");
        Ok(MigrationReport {
            batch_id: batch.id,
            collection,
            selected: batch.record_ids.len(),
            moved,
            status: batch.status,
            resumed,
        })
    }

    /// Deletes one record from primary once the archive holds its current
    /// copy. The delete only succeeds against the copy that was archived; a
    /// write landing in between is archived first and the delete retried.
    async fn remove_one(
        &self,
        collection: Collection,
        id: &RecordId,
        archived: Option<&Record>,
    ) -> Result<Removal> {
        let current = self
            .primary_calls
            .call("recheck", || self.primary.get(collection, id))
            .await?;
        let Some(mut expected) = current else {
            return Ok(Removal::Absent);
        };

        let mut archived_copy = match archived {
            Some(record) => Some(record.clone()),
            None => {
                self.archive_calls
                    .call("verify", || self.archive.get(collection, id))
                    .await?
            }
        };

        for _ in 0..MAX_REARCHIVE_ROUNDS {
            if archived_copy.as_ref() != Some(&expected) {
                tracing::debug!(%collection, %id, "Primary copy differs from archive, re-archiving");
                self.archive_calls
                    .retry
                    .execute("rearchive", || self.write_confirmed(collection, &expected))
                    .await?;
                archived_copy = Some(expected.clone());
            }

            let outcome = self
                .primary_calls
                .call("delete", || self.primary.delete_if_unchanged(collection, &expected))
                .await?;
            match outcome {
                ConditionalDelete::Deleted => return Ok(Removal::Removed),
                ConditionalDelete::Absent => return Ok(Removal::Absent),
                ConditionalDelete::Changed(current) => {
                    tracing::debug!(%collection, %id, "Primary copy changed before delete");
                    expected = current;
                }
            }
        }

        Err(StorageError::unavailable(
            Tier::Primary,
            format!("{id} kept changing during migration"),
        ))
    }

    /// Batches left unfinished by a previous run, oldest first.
    pub async fn incomplete_batches(&self) -> Result<Vec<MigrationBatch>> {
        self.journal.incomplete().await
    }

    /// Completes a batch left unfinished by a previous run.
    ///
    /// A `written-to-archive` batch resumes at the primary-delete step
    /// without rewriting the archive. A `pending` batch is marked `failed`;
    /// its records never left primary and are reselected by the next
    /// trigger. The caller must hold the collection's migration claim.
    pub async fn resume_batch(&self, mut batch: MigrationBatch) -> Result<MigrationReport> {
        match batch.status {
            BatchStatus::WrittenToArchive => {
                tracing::info!(batch_id = %batch.id, collection = %batch.collection, "Resuming migration batch");
                self.remove_from_primary(&mut batch, &HashMap::new(), true)
                    .await
            }
            BatchStatus::Pending | BatchStatus::Failed | BatchStatus::RemovedFromPrimary => {
                if batch.status == BatchStatus::Pending {
                    tracing::info!(batch_id = %batch.id, collection = %batch.collection, "Abandoning pending migration batch");
                    batch.advance(BatchStatus::Failed);
                }
                self.journal.record(&batch).await?;
                Ok(MigrationReport {
                    batch_id: batch.id,
                    collection: batch.collection,
                    selected: batch.record_ids.len(),
                    moved: 0,
                    status: batch.status,
                    resumed: true,
                })
            }
        }
    }
}
