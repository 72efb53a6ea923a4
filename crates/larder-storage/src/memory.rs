//! In-memory document store used as the primary tier.
//!
//! Keeps each collection in a `BTreeMap` ordered by [`SortKey`] with an id
//! index on the side, supports every filter natively and can optionally be
//! backed by a JSON snapshot file.

use crate::adapter::{collect_page, ConditionalDelete, ListQuery, Page, StoreAdapter, Tier};
use crate::{Result, StorageError};
use async_trait::async_trait;
use larder_types::{Collection, FilterSupport, Record, RecordId, SortKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct CollectionData {
    by_key: BTreeMap<SortKey, Record>,
    index: HashMap<RecordId, SortKey>,
}

impl CollectionData {
    fn upsert(&mut self, record: Record) {
        let key = record.sort_key();
        if let Some(old_key) = self.index.insert(record.id.clone(), key.clone()) {
            if old_key != key {
                self.by_key.remove(&old_key);
            }
        }
        self.by_key.insert(key, record);
    }

    fn remove(&mut self, id: &RecordId) -> bool {
        match self.index.remove(id) {
            Some(key) => self.by_key.remove(&key).is_some(),
            None => false,
        }
    }
}

/// Fast, optionally capacity-bounded document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, CollectionData>>,
    /// Hard per-collection limit; new inserts beyond it fail.
    max_records: Option<usize>,
    /// Snapshot file written by `flush`.
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    /// Creates an empty, unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that rejects inserts beyond `max_records` per collection.
    #[must_use]
    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            max_records: Some(max_records),
            ..Self::default()
        }
    }

    /// Opens a store backed by a snapshot file, loading it if it exists.
    pub async fn open(path: impl AsRef<Path>, max_records: Option<usize>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut collections: HashMap<Collection, CollectionData> = HashMap::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let saved: HashMap<Collection, Vec<Record>> = serde_json::from_slice(&bytes)?;
                for (collection, records) in saved {
                    let data = collections.entry(collection).or_default();
                    for record in records {
                        data.upsert(record);
                    }
                }
                tracing::info!(path = %path.display(), "Loaded primary snapshot");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            collections: RwLock::new(collections),
            max_records,
            snapshot: Some(path),
        })
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn filter_support(&self) -> FilterSupport {
        FilterSupport::Full
    }

    async fn put(&self, collection: Collection, record: &Record) -> Result<()> {
        let mut collections = self.collections.write();
        let data = collections.entry(collection).or_default();

        if let Some(max) = self.max_records {
            if !data.index.contains_key(&record.id) && data.index.len() >= max {
                return Err(StorageError::StorageFull { tier: Tier::Primary });
            }
        }

        data.upsert(record.clone());
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &RecordId) -> Result<Option<Record>> {
        let collections = self.collections.read();
        Ok(collections
            .get(&collection)
            .and_then(|data| data.index.get(id).and_then(|key| data.by_key.get(key)))
            .cloned())
    }

    async fn list(&self, collection: Collection, query: &ListQuery) -> Result<Page> {
        let collections = self.collections.read();
        Ok(match collections.get(&collection) {
            Some(data) => collect_page(data.by_key.values(), query),
            None => Page::default(),
        })
    }

    async fn delete(&self, collection: Collection, id: &RecordId) -> Result<bool> {
        let mut collections = self.collections.write();
        Ok(collections
            .get_mut(&collection)
            .is_some_and(|data| data.remove(id)))
    }

    async fn count(&self, collection: Collection) -> Result<usize> {
        let collections = self.collections.read();
        Ok(collections.get(&collection).map_or(0, |data| data.index.len()))
    }

    async fn delete_if_unchanged(&self, collection: Collection, expected: &Record) -> Result<ConditionalDelete> {
        let mut collections = self.collections.write();
        let Some(data) = collections.get_mut(&collection) else {
            return Ok(ConditionalDelete::Absent);
        };
        let current = data
            .index
            .get(&expected.id)
            .and_then(|key| data.by_key.get(key));
        let outcome = match current {
            None => ConditionalDelete::Absent,
            Some(current) if current != expected => ConditionalDelete::Changed(current.clone()),
            Some(_) => ConditionalDelete::Deleted,
        };
        if matches!(outcome, ConditionalDelete::Deleted) {
            data.remove(&expected.id);
        }
        Ok(outcome)
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let bytes = {
            let collections = self.collections.read();
            let saved: HashMap<Collection, Vec<&Record>> = collections
                .iter()
                .map(|(c, data)| (*c, data.by_key.values().collect()))
                .collect();
            serde_json::to_vec(&saved)?
        };

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_types::{Fields, Filter, Timestamp};
    use serde_json::json;

    fn record(id: &str, created: i64, status: &str) -> Record {
        let mut fields = Fields::new();
        fields.insert("status".into(), json!(status));
        Record::with_identity(id.into(), Timestamp::from_millis(created), fields)
    }

    #[tokio::test]
    async fn put_is_idempotent_upsert() {
        let store = MemoryStore::new();
        store.put(Collection::Orders, &record("a", 1, "open")).await.unwrap();
        store.put(Collection::Orders, &record("a", 1, "paid")).await.unwrap();

        assert_eq!(store.count(Collection::Orders).await.unwrap(), 1);
        let got = store.get(Collection::Orders, &"a".into()).await.unwrap().unwrap();
        assert_eq!(got.field("status"), Some(&json!("paid")));
    }

    #[tokio::test]
    async fn delete_absent_is_not_an_error() {
        let store = MemoryStore::new();
        assert!(!store.delete(Collection::Users, &"ghost".into()).await.unwrap());
    }

    #[tokio::test]
    async fn conditional_delete_keeps_changed_copy() {
        let store = MemoryStore::new();
        let original = record("a", 1, "open");
        store.put(Collection::Orders, &original).await.unwrap();
        let updated = record("a", 1, "paid");
        store.put(Collection::Orders, &updated).await.unwrap();

        let outcome = store.delete_if_unchanged(Collection::Orders, &original).await.unwrap();
        assert_eq!(outcome, ConditionalDelete::Changed(updated.clone()));
        assert_eq!(store.count(Collection::Orders).await.unwrap(), 1);

        let outcome = store.delete_if_unchanged(Collection::Orders, &updated).await.unwrap();
        assert_eq!(outcome, ConditionalDelete::Deleted);
        let outcome = store.delete_if_unchanged(Collection::Orders, &updated).await.unwrap();
        assert_eq!(outcome, ConditionalDelete::Absent);
    }

    #[tokio::test]
    async fn capacity_rejects_new_inserts_only() {
        let store = MemoryStore::with_capacity(1);
        store.put(Collection::Orders, &record("a", 1, "open")).await.unwrap();

        let err = store.put(Collection::Orders, &record("b", 2, "open")).await.unwrap_err();
        assert!(matches!(err, StorageError::StorageFull { tier: Tier::Primary }));

        // Updating a resident record still works.
        store.put(Collection::Orders, &record("a", 1, "paid")).await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_natively() {
        let store = MemoryStore::new();
        for (i, status) in ["open", "paid", "open"].iter().enumerate() {
            store
                .put(Collection::Orders, &record(&format!("o{i}"), i as i64, status))
                .await
                .unwrap();
        }

        let query = ListQuery {
            filter: Filter::new().where_eq("status", json!("open")),
            ..ListQuery::scan(10)
        };
        let page = store.list(Collection::Orders, &query).await.unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["o0", "o2"]);
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primary.json");

        let store = MemoryStore::open(&path, None).await.unwrap();
        store.put(Collection::MenuItems, &record("m1", 5, "active")).await.unwrap();
        store.flush().await.unwrap();

        let reopened = MemoryStore::open(&path, None).await.unwrap();
        assert!(reopened
            .get(Collection::MenuItems, &"m1".into())
            .await
            .unwrap()
            .is_some());
    }
}
