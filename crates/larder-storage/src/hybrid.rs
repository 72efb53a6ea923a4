//! Hybrid storage facade.
//!
//! [`HybridStore`] is the only entry point the application uses. Writes land
//! in primary; the capacity monitor watches primary grow and hands migration
//! triggers to a background worker; reads go through the query router.
//!
//! ```no_run
//! use larder_storage::{HybridStore, MemoryJournal, MemoryStore, StorageConfig};
//! use larder_types::{Collection, Fields, Record};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> larder_storage::Result<()> {
//! let store = HybridStore::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryJournal::new()),
//!     StorageConfig::default(),
//! )?;
//! let worker = store.start(CancellationToken::new());
//!
//! let order = store.create(Collection::Orders, Record::new(Fields::new())).await?;
//! let fetched = store.get(Collection::Orders, &order.id).await?;
//! assert_eq!(fetched, order);
//! # drop(worker);
//! # Ok(())
//! # }
//! ```

use crate::adapter::{StoreAdapter, Tier};
use crate::capacity::{CapacityMonitor, CapacitySnapshot, MigrationTrigger};
use crate::config::StorageConfig;
use crate::journal::BatchJournal;
use crate::migration::{MigrationEngine, MigrationReport};
use crate::resilience::{CallPolicy, RetryPolicy};
use crate::router::{ListRequest, ListResult, QueryRouter};
use crate::stats::{StatsSnapshot, TierStats};
use crate::{Result, StorageError};
use larder_types::{Collection, Fields, Record, RecordId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

struct Inner {
    primary: Arc<dyn StoreAdapter>,
    archive: Arc<dyn StoreAdapter>,
    primary_calls: CallPolicy,
    archive_calls: CallPolicy,
    monitor: CapacityMonitor,
    engine: MigrationEngine,
    router: QueryRouter,
    stats: Arc<TierStats>,
    worker_tick: Duration,
    triggers: mpsc::UnboundedSender<MigrationTrigger>,
    /// Taken by the worker when it starts.
    pending: Mutex<Option<mpsc::UnboundedReceiver<MigrationTrigger>>>,
}

/// Single logical store over a primary and an archive tier.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HybridStore {
    inner: Arc<Inner>,
}

impl HybridStore {
    /// Composes the tier from its adapters.
    ///
    /// Fails with [`StorageError::InvalidConfig`] if `config` is inconsistent.
    pub fn new(
        primary: Arc<dyn StoreAdapter>,
        archive: Arc<dyn StoreAdapter>,
        journal: Arc<dyn BatchJournal>,
        config: StorageConfig,
    ) -> Result<Self> {
        config.check()?;

        let retry = RetryPolicy::from(&config.retry);
        let primary_calls = CallPolicy::new(Tier::Primary, config.op_timeout(), retry.clone());
        let archive_calls = CallPolicy::new(Tier::Archive, config.op_timeout(), retry);
        let stats = Arc::new(TierStats::default());
        let (triggers, pending) = mpsc::unbounded_channel();

        let engine = MigrationEngine::new(
            primary.clone(),
            archive.clone(),
            journal,
            primary_calls.clone(),
            archive_calls.clone(),
            config.migration.clone(),
        );
        let router = QueryRouter::new(
            primary.clone(),
            archive.clone(),
            primary_calls.clone(),
            archive_calls.clone(),
            config.router.clone(),
            stats.clone(),
        );

        tracing::info!(
            primary = primary.name(),
            archive = archive.name(),
            threshold = config.capacity.threshold,
            max_capacity = config.capacity.max_capacity,
            "Hybrid storage tier initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                primary,
                archive,
                primary_calls,
                archive_calls,
                monitor: CapacityMonitor::new(config.capacity),
                engine,
                router,
                stats,
                worker_tick: Duration::from_millis(config.migration.worker_tick_ms),
                triggers,
                pending: Mutex::new(Some(pending)),
            }),
        })
    }

    /// Writes a new record to primary.
    ///
    /// Writes never go to the archive: if primary rejects the write after
    /// retries, the error is returned and the caller retries. A primary at
    /// its hard limit is reported as [`StorageError::StoreUnavailable`].
    pub async fn create(&self, collection: Collection, record: Record) -> Result<Record> {
        let inner = &self.inner;
        match inner
            .primary_calls
            .call("create", || inner.primary.put(collection, &record))
            .await
        {
            Ok(()) => {}
            Err(StorageError::StorageFull { tier }) => {
                tracing::warn!(%collection, "Primary full, reconciling capacity");
                self.reconcile(collection).await;
                return Err(StorageError::unavailable(
                    tier,
                    format!("{collection} is full until migration frees space"),
                ));
            }
            Err(e) => return Err(e),
        }

        let observation = inner.monitor.record_create(collection);
        if let Some(trigger) = observation.trigger {
            self.schedule(trigger);
        }
        if observation.reconcile_due {
            self.reconcile(collection).await;
        }

        Ok(record)
    }

    /// Applies `patch` to the record wherever it lives.
    ///
    /// Archived records are updated in the archive and stay there.
    pub async fn update(&self, collection: Collection, id: &RecordId, patch: &Fields) -> Result<Record> {
        let inner = &self.inner;

        let resident = inner
            .primary_calls
            .call("get", || inner.primary.get(collection, id))
            .await?;
        if let Some(mut record) = resident {
            record.apply_patch(patch);
            inner
                .primary_calls
                .call("update", || inner.primary.put(collection, &record))
                .await?;
            return Ok(record);
        }

        let archived = inner
            .archive_calls
            .call("get", || inner.archive.get(collection, id))
            .await?;
        let Some(mut record) = archived else {
            return Err(StorageError::NotFound {
                collection,
                id: id.clone(),
            });
        };
        record.apply_patch(patch);
        inner
            .archive_calls
            .call("update", || inner.archive.put(collection, &record))
            .await?;
        tracing::debug!(%collection, %id, "Updated archived record");
        Ok(record)
    }

    /// Deletes the record from both tiers.
    ///
    /// Succeeds if either tier's delete succeeds; deleting an absent record
    /// is not an error. Primary is deleted first so a concurrent migration
    /// can tell the record is gone and drop its archived copy.
    pub async fn delete(&self, collection: Collection, id: &RecordId) -> Result<()> {
        let inner = &self.inner;

        let primary = inner
            .primary_calls
            .call("delete", || inner.primary.delete(collection, id))
            .await;
        let archive = inner
            .archive_calls
            .call("delete", || inner.archive.delete(collection, id))
            .await;

        match (primary, archive) {
            (Ok(removed), archive) => {
                if removed {
                    inner.monitor.record_delete(collection);
                }
                if let Err(e) = archive {
                    tracing::warn!(%collection, %id, error = %e, "Archive delete failed");
                }
                Ok(())
            }
            (Err(e), Ok(_)) => {
                tracing::warn!(%collection, %id, error = %e, "Primary delete failed");
                Ok(())
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// Fetches a record by id from whichever tier holds it.
    pub async fn get(&self, collection: Collection, id: &RecordId) -> Result<Record> {
        self.inner.router.get(collection, id).await
    }

    /// Lists one page across both tiers.
    pub async fn list(&self, collection: Collection, request: &ListRequest) -> Result<ListResult> {
        self.inner.router.list(collection, request).await
    }

    /// Lists one page across both tiers, abandoning the scan if `cancel`
    /// fires.
    pub async fn list_cancellable(
        &self,
        collection: Collection,
        request: &ListRequest,
        cancel: &CancellationToken,
    ) -> Result<ListResult> {
        self.inner
            .router
            .list_cancellable(collection, request, cancel)
            .await
    }

    /// Runs one migration batch of `collection` now, regardless of the
    /// threshold.
    ///
    /// A threshold trigger still waiting for the worker is taken over.
    /// Returns an empty list if a migration of the collection is already
    /// running.
    pub async fn archive_now(&self, collection: Collection) -> Result<Vec<MigrationReport>> {
        let batch = self.inner.engine.max_batch_size();
        match self.inner.monitor.try_begin_forced(collection, batch) {
            Some(trigger) => {
                TierStats::bump(&self.inner.stats.migrations_scheduled);
                self.migrate(trigger).await
            }
            None => {
                tracing::info!(%collection, "Migration already running, forced run coalesced");
                Ok(Vec::new())
            }
        }
    }

    /// Completes migration batches interrupted by a crash.
    ///
    /// Batches of a collection with a live migration are left for the next
    /// call.
    pub async fn resume(&self) -> Result<Vec<MigrationReport>> {
        let inner = &self.inner;
        let mut reports = Vec::new();

        for batch in inner.engine.incomplete_batches().await? {
            let collection = batch.collection;
            if !inner.monitor.try_claim(collection) {
                tracing::debug!(batch_id = %batch.id, %collection, "Collection busy, deferring resume");
                continue;
            }
            match inner.engine.resume_batch(batch).await {
                Ok(report) => {
                    if let Some(next) = inner.monitor.complete(collection, report.moved) {
                        self.schedule(next);
                    }
                    TierStats::add(&inner.stats.records_archived, report.moved);
                    reports.push(report);
                }
                Err(e) => {
                    inner.monitor.fail(collection, 0);
                    return Err(Self::surface(e));
                }
            }
        }

        Ok(reports)
    }

    /// Replaces every collection's local counter with the primary store's
    /// count, scheduling migrations where the threshold is reached.
    pub async fn reconcile_all(&self) {
        for collection in Collection::ALL {
            self.reconcile(collection).await;
        }
    }

    async fn reconcile(&self, collection: Collection) {
        let inner = &self.inner;
        match inner
            .primary_calls
            .call("count", || inner.primary.count(collection))
            .await
        {
            Ok(count) => {
                if let Some(trigger) = inner.monitor.reconcile(collection, count) {
                    self.schedule(trigger);
                }
            }
            Err(e) => tracing::warn!(%collection, error = %e, "Capacity reconcile failed"),
        }
    }

    fn schedule(&self, trigger: MigrationTrigger) {
        TierStats::bump(&self.inner.stats.migrations_scheduled);
        if self.inner.triggers.send(trigger).is_err() {
            tracing::warn!(collection = %trigger.collection, "Migration worker gone, dropping trigger");
            self.inner.monitor.abandon(trigger.collection);
        }
    }

    /// Runs batches until the trigger's target is met or primary runs dry.
    async fn migrate(&self, trigger: MigrationTrigger) -> Result<Vec<MigrationReport>> {
        let inner = &self.inner;
        let collection = trigger.collection;
        let mut remaining = trigger.target;
        let mut reports = Vec::new();
        let mut moved = 0;

        let outcome = loop {
            if remaining == 0 {
                break Ok(());
            }
            match inner.engine.run_batch(collection, remaining).await {
                Ok(Some(report)) => {
                    remaining = remaining.saturating_sub(report.selected);
                    moved += report.moved;
                    reports.push(report);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        TierStats::add(&inner.stats.records_archived, moved);
        match outcome {
            Ok(()) => {
                TierStats::bump(&inner.stats.migrations_completed);
                if let Some(next) = inner.monitor.complete(collection, moved) {
                    self.schedule(next);
                }
                Ok(reports)
            }
            Err(e) => {
                inner.monitor.fail(collection, moved);
                TierStats::bump(&inner.stats.migrations_failed);
                tracing::warn!(%collection, moved, error = %e, "Migration suspended");
                Err(Self::surface(e))
            }
        }
    }

    /// Keeps engine-internal errors away from callers.
    fn surface(error: StorageError) -> StorageError {
        match error {
            StorageError::MigrationIncomplete { batch_id, .. } => StorageError::unavailable(
                Tier::Primary,
                format!("migration batch {batch_id} is waiting to finish primary deletes"),
            ),
            other => other,
        }
    }

    /// Runs migrations scheduled while no worker was running, including
    /// any raised by those migrations.
    pub async fn run_pending_migrations(&self) -> Vec<MigrationReport> {
        let mut reports = Vec::new();
        loop {
            let wakeup = match self.inner.pending.lock().await.as_mut() {
                Some(receiver) => receiver.try_recv().ok(),
                None => None,
            };
            let Some(wakeup) = wakeup else {
                break;
            };
            let Some(trigger) = self.inner.monitor.begin_queued(wakeup.collection) else {
                continue;
            };
            if let Ok(batch) = self.migrate(trigger).await {
                reports.extend(batch);
            }
        }
        reports
    }

    /// Background maintenance: reconcile counters, finish interrupted
    /// batches and flush primary.
    async fn tick(&self) {
        self.reconcile_all().await;
        if let Err(e) = self.resume().await {
            tracing::warn!(error = %e, "Resuming interrupted batches failed");
        }
        if let Err(e) = self.inner.primary.flush().await {
            tracing::warn!(error = %e, "Primary flush failed");
        }
    }

    /// Spawns the migration worker.
    ///
    /// The worker runs triggered migrations one at a time and performs
    /// maintenance every tick until `shutdown` fires. Returns `None` if a
    /// worker was already started.
    pub fn start(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let mut receiver = self.inner.pending.try_lock().ok()?.take()?;
        let store = self.clone();
        let mut interval = tokio::time::interval(self.inner.worker_tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Some(tokio::spawn(async move {
            tracing::info!("Migration worker started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(wakeup) = receiver.recv() => {
                        if let Some(trigger) = store.inner.monitor.begin_queued(wakeup.collection) {
                            // Errors are logged and counted by `migrate`.
                            let _ = store.migrate(trigger).await;
                        }
                    }
                    _ = interval.tick() => store.tick().await,
                }
            }
            tracing::info!("Migration worker stopped");
        }))
    }

    /// Flushes both tiers.
    pub async fn flush(&self) -> Result<()> {
        self.inner.primary.flush().await?;
        self.inner.archive.flush().await
    }

    /// Tier statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Capacity state of every collection.
    #[must_use]
    pub fn capacity(&self) -> Vec<CapacitySnapshot> {
        self.inner.monitor.snapshot()
    }
}
