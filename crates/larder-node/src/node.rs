//! Opening the storage tier and running operator commands against it.

use anyhow::Context;
use larder_storage::{
    FileJournal, HybridStore, MemoryStore, SheetStore, StorageConfig, StoreAdapter,
};
use larder_types::Collection;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Opens the adapters named by `config` and composes the tier.
pub async fn open(config: &StorageConfig) -> anyhow::Result<HybridStore> {
    let primary: Arc<dyn StoreAdapter> = match &config.primary_snapshot {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            Arc::new(
                MemoryStore::open(path, None)
                    .await
                    .with_context(|| format!("failed to load primary snapshot {}", path.display()))?,
            )
        }
        None => Arc::new(MemoryStore::new()),
    };

    let archive = SheetStore::open(&config.archive_dir)
        .await
        .with_context(|| format!("failed to open archive at {}", config.archive_dir.display()))?;
    let journal = FileJournal::open(&config.journal_path)
        .await
        .with_context(|| {
            format!(
                "failed to open migration journal {}",
                config.journal_path.display()
            )
        })?;

    let store = HybridStore::new(primary, Arc::new(archive), Arc::new(journal), config.clone())?;
    Ok(store)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs the tier until ctrl-c.
pub async fn serve(store: HybridStore) -> anyhow::Result<()> {
    let resumed = store.resume().await?;
    if !resumed.is_empty() {
        tracing::info!(batches = resumed.len(), "Finished interrupted migrations");
    }
    store.reconcile_all().await;

    let shutdown = CancellationToken::new();
    let worker = store
        .start(shutdown.clone())
        .context("migration worker already running")?;

    tracing::info!("Larder node is ready. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    shutdown.cancel();
    worker.await.context("migration worker panicked")?;
    store.flush().await?;
    Ok(())
}

/// Migrates one batch of `collection`, then any migrations the reconcile
/// queued, and prints the reports.
pub async fn archive_now(store: HybridStore, collection: Collection) -> anyhow::Result<()> {
    store.resume().await?;
    store.reconcile_all().await;
    let mut reports = store.archive_now(collection).await?;
    reports.extend(store.run_pending_migrations().await);
    store.flush().await?;
    print_json(&reports)
}

/// Prints capacity snapshots.
pub async fn stats(store: HybridStore) -> anyhow::Result<()> {
    #[derive(Serialize)]
    struct Report {
        capacity: Vec<larder_storage::CapacitySnapshot>,
        stats: larder_storage::StatsSnapshot,
    }

    store.reconcile_all().await;
    print_json(&Report {
        capacity: store.capacity(),
        stats: store.stats(),
    })
}

/// Completes interrupted batches and prints the reports.
pub async fn resume(store: HybridStore) -> anyhow::Result<()> {
    let mut reports = store.resume().await?;
    reports.extend(store.run_pending_migrations().await);
    store.flush().await?;
    print_json(&reports)
}
