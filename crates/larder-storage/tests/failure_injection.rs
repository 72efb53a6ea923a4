//! Failure Injection Tests
//!
//! Integration tests with injected store failures and simulated restarts:
//! - Archive outages degrade reads instead of failing them
//! - Primary outages fall through to the archive for lookups
//! - Batches interrupted between archive write and primary delete resume
//! - File-backed adapters and journal survive a process restart

use larder_storage::{
    CapacityConfig, FaultyStore, FileJournal, HybridStore, ListRequest, MemoryJournal,
    MemoryStore, SheetStore, StorageConfig, StorageError, StoreAdapter, Tier,
};
use larder_types::{Collection, Fields, Filter, Record, RecordId, Timestamp};
use serde_json::json;
use std::sync::Arc;

fn fast_config() -> StorageConfig {
    let mut config = StorageConfig {
        capacity: CapacityConfig {
            max_capacity: 100,
            threshold: 90,
            hysteresis: 0.8,
            ..CapacityConfig::default()
        },
        op_timeout_ms: 1_000,
        ..StorageConfig::default()
    };
    config.retry.max_attempts = 2;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter = false;
    config
}

fn record(n: i64, status: &str) -> Record {
    let fields = json!({ "status": status, "total": n });
    Record::with_identity(
        RecordId::new(format!("o{n:03}")),
        Timestamp::from_millis(1_000 + n),
        fields.as_object().cloned().unwrap_or_else(Fields::new),
    )
}

// ============================================================================
// Archive Outage
// ============================================================================

/// Listing and lookups keep serving primary while the archive is down.
#[tokio::test]
async fn test_archive_outage_degrades_reads() {
    let primary = Arc::new(MemoryStore::new());
    let archive = Arc::new(FaultyStore::new(MemoryStore::new(), Tier::Archive));
    let store = HybridStore::new(
        primary,
        archive.clone(),
        Arc::new(MemoryJournal::new()),
        fast_config(),
    )
    .unwrap();

    let old = store.create(Collection::Orders, record(1, "served")).await.unwrap();
    store.archive_now(Collection::Orders).await.unwrap();
    let recent = store.create(Collection::Orders, record(2, "open")).await.unwrap();

    archive.set_fail_all(true);

    let page = store.list(Collection::Orders, &ListRequest::new()).await.unwrap();
    assert!(page.degraded);
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].id, recent.id);

    assert!(store.get(Collection::Orders, &recent.id).await.is_ok());
    assert!(matches!(
        store.get(Collection::Orders, &old.id).await,
        Err(StorageError::ArchiveDegraded { .. })
    ));
    assert!(store.stats().degraded_reads >= 2);

    // Writes keep landing in primary.
    store.create(Collection::Orders, record(3, "open")).await.unwrap();

    // Migration is suspended, not lossy.
    assert!(store.archive_now(Collection::Orders).await.is_err());
    assert_eq!(store.list(Collection::Orders, &ListRequest::new()).await.unwrap().records.len(), 2);

    archive.heal();
    let page = store.list(Collection::Orders, &ListRequest::new()).await.unwrap();
    assert!(!page.degraded);
    assert_eq!(page.records.len(), 3);
}

/// Lookups fall through to the archive while primary is down.
#[tokio::test]
async fn test_primary_outage_falls_through_to_archive() {
    let primary = Arc::new(FaultyStore::new(MemoryStore::new(), Tier::Primary));
    let store = HybridStore::new(
        primary.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryJournal::new()),
        fast_config(),
    )
    .unwrap();

    let archived = store.create(Collection::Users, record(1, "inactive")).await.unwrap();
    store.archive_now(Collection::Users).await.unwrap();

    primary.set_fail_all(true);
    assert_eq!(store.get(Collection::Users, &archived.id).await.unwrap(), archived);
    assert!(store.create(Collection::Users, record(2, "new")).await.is_err());
}

// ============================================================================
// Resume After Crash
// ============================================================================

/// A batch stuck between archive confirmation and primary delete finishes
/// after a restart without writing to the archive again.
#[tokio::test]
async fn test_resume_after_crash_skips_archive_writes() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("migrations.json");
    let primary = Arc::new(FaultyStore::new(MemoryStore::new(), Tier::Primary));
    let archive = Arc::new(FaultyStore::new(MemoryStore::new(), Tier::Archive));

    let ids: Vec<RecordId> = {
        let store = HybridStore::new(
            primary.clone(),
            archive.clone(),
            Arc::new(FileJournal::open(&journal_path).await.unwrap()),
            fast_config(),
        )
        .unwrap();
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(store.create(Collection::Orders, record(n, "served")).await.unwrap().id);
        }

        // The process dies before any primary delete lands.
        primary.set_fail_deletes(true);
        let err = store.archive_now(Collection::Orders).await.unwrap_err();
        assert!(!matches!(err, StorageError::MigrationIncomplete { .. }));

        // Both copies exist; readers still see primary's.
        for id in &ids {
            assert!(store.get(Collection::Orders, id).await.is_ok());
        }
        ids
    };

    primary.heal();
    let puts_before_restart = archive.put_count();

    let restarted = HybridStore::new(
        primary.clone(),
        archive.clone(),
        Arc::new(FileJournal::open(&journal_path).await.unwrap()),
        fast_config(),
    )
    .unwrap();
    let reports = restarted.resume().await.unwrap();

    assert_eq!(reports.len(), 1);
    assert!(reports[0].resumed);
    assert_eq!(reports[0].moved, 5);
    assert_eq!(archive.put_count(), puts_before_restart);
    assert_eq!(primary.inner().count(Collection::Orders).await.unwrap(), 0);
    for id in &ids {
        assert!(restarted.get(Collection::Orders, id).await.is_ok());
    }

    // Nothing left to resume.
    assert!(restarted.resume().await.unwrap().is_empty());
}

/// A batch that never got past archive writes is abandoned on restart; its
/// records stay in primary.
#[tokio::test]
async fn test_pending_batch_is_abandoned_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("migrations.json");
    let primary = Arc::new(MemoryStore::new());
    primary.put(Collection::Orders, &record(1, "open")).await.unwrap();

    {
        use larder_storage::{BatchJournal, MigrationBatch};
        let journal = FileJournal::open(&journal_path).await.unwrap();
        let batch = MigrationBatch::new(Collection::Orders, vec![record(1, "open").id]);
        journal.record(&batch).await.unwrap();
    }

    let store = HybridStore::new(
        primary.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(FileJournal::open(&journal_path).await.unwrap()),
        fast_config(),
    )
    .unwrap();
    let reports = store.resume().await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].moved, 0);
    assert_eq!(primary.count(Collection::Orders).await.unwrap(), 1);
}

// ============================================================================
// File-Backed Tiers
// ============================================================================

/// Snapshot primary plus sheet archive, across a restart, with a filter the
/// sheet store cannot evaluate.
#[tokio::test]
async fn test_file_backed_tiers_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("primary.json");
    let sheets = dir.path().join("archive");
    let journal = dir.path().join("migrations.json");

    let mut config = fast_config();
    config.router.scan_page_size = 4;
    config.router.max_scan_rows = 8;

    let open = |config: StorageConfig| {
        let (snapshot, sheets, journal) = (snapshot.clone(), sheets.clone(), journal.clone());
        async move {
            HybridStore::new(
                Arc::new(MemoryStore::open(&snapshot, None).await.unwrap()),
                Arc::new(SheetStore::open(&sheets).await.unwrap()),
                Arc::new(FileJournal::open(&journal).await.unwrap()),
                config,
            )
            .unwrap()
        }
    };

    {
        let store = open(config.clone()).await;
        for n in 0..30 {
            let status = if n % 3 == 0 { "refunded" } else { "paid" };
            store.create(Collection::Orders, record(n, status)).await.unwrap();
        }
        store.archive_now(Collection::Orders).await.unwrap();
        store.flush().await.unwrap();
    }

    let store = open(config).await;
    let filter = Filter::new()
        .where_eq("status", json!("refunded"))
        .where_range("total", Some(json!(10)), None);

    let mut totals = Vec::new();
    let mut token = None;
    loop {
        let request = ListRequest::new()
            .with_filter(filter.clone())
            .with_limit(3)
            .with_page_token(token);
        let page = store.list(Collection::Orders, &request).await.unwrap();
        totals.extend(page.records.iter().filter_map(|r| r.field("total")?.as_i64()));
        token = page.next_page_token;
        if token.is_none() {
            break;
        }
    }

    assert_eq!(totals, vec![12, 15, 18, 21, 24, 27]);
}
