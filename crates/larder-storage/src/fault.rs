//! Failure injection for store adapters.
//!
//! [`FaultyStore`] wraps any adapter and can make selected operations fail,
//! stall, or silently drop writes. Used by the test suite and by chaos drills
//! against a running node.

use crate::adapter::{ConditionalDelete, ListQuery, Page, StoreAdapter, Tier};
use crate::{Result, StorageError};
use async_trait::async_trait;
use larder_types::{Collection, FilterSupport, Record, RecordId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Counters of calls that reached the wrapper.
#[derive(Debug, Default)]
struct OpCounters {
    puts: AtomicUsize,
    gets: AtomicUsize,
    lists: AtomicUsize,
    deletes: AtomicUsize,
}

/// A wrapper around a store adapter that can inject failures.
pub struct FaultyStore<S> {
    inner: S,
    tier: Tier,
    fail_all: AtomicBool,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
    fail_lists: AtomicBool,
    fail_deletes: AtomicBool,
    /// Puts that still succeed before puts start failing.
    puts_before_failure: RwLock<Option<usize>>,
    /// Acknowledge puts without storing them.
    drop_puts: AtomicBool,
    latency: RwLock<Option<Duration>>,
    counters: OpCounters,
}

impl<S: StoreAdapter> FaultyStore<S> {
    /// Wraps `inner`; injected errors report `tier`.
    pub fn new(inner: S, tier: Tier) -> Self {
        Self {
            inner,
            tier,
            fail_all: AtomicBool::new(false),
            fail_puts: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            puts_before_failure: RwLock::new(None),
            drop_puts: AtomicBool::new(false),
            latency: RwLock::new(None),
            counters: OpCounters::default(),
        }
    }

    /// Returns the wrapped adapter.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Enable or disable complete failure mode.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Make every put fail.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make every get fail.
    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Make every list fail.
    pub fn set_fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Make every delete fail.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Let `n` more puts succeed, then fail every following put.
    pub fn fail_puts_after(&self, n: usize) {
        *self.puts_before_failure.write() = Some(n);
    }

    /// Acknowledge puts without storing them.
    pub fn set_drop_puts(&self, drop: bool) {
        self.drop_puts.store(drop, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Clears every injected fault.
    pub fn heal(&self) {
        self.set_fail_all(false);
        self.set_fail_puts(false);
        self.set_fail_gets(false);
        self.set_fail_lists(false);
        self.set_fail_deletes(false);
        self.set_drop_puts(false);
        self.set_latency(None);
        *self.puts_before_failure.write() = None;
    }

    /// Number of put calls received.
    pub fn put_count(&self) -> usize {
        self.counters.puts.load(Ordering::SeqCst)
    }

    /// Number of get calls received.
    pub fn get_count(&self) -> usize {
        self.counters.gets.load(Ordering::SeqCst)
    }

    /// Number of list calls received.
    pub fn list_count(&self) -> usize {
        self.counters.lists.load(Ordering::SeqCst)
    }

    /// Number of delete calls received.
    pub fn delete_count(&self) -> usize {
        self.counters.deletes.load(Ordering::SeqCst)
    }

    async fn before_call(&self, op_flag: &AtomicBool, op: &str) -> Result<()> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_all.load(Ordering::SeqCst) || op_flag.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(
                self.tier,
                format!("injected {op} failure"),
            ));
        }
        Ok(())
    }

    fn take_put_budget(&self) -> bool {
        let mut budget = self.puts_before_failure.write();
        match budget.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }
}

#[async_trait]
impl<S: StoreAdapter> StoreAdapter for FaultyStore<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn filter_support(&self) -> FilterSupport {
        self.inner.filter_support()
    }

    async fn put(&self, collection: Collection, record: &Record) -> Result<()> {
        self.counters.puts.fetch_add(1, Ordering::SeqCst);
        self.before_call(&self.fail_puts, "put").await?;
        if !self.take_put_budget() {
            return Err(StorageError::unavailable(self.tier, "injected put failure"));
        }
        if self.drop_puts.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.put(collection, record).await
    }

    async fn get(&self, collection: Collection, id: &RecordId) -> Result<Option<Record>> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.before_call(&self.fail_gets, "get").await?;
        self.inner.get(collection, id).await
    }

    async fn list(&self, collection: Collection, query: &ListQuery) -> Result<Page> {
        self.counters.lists.fetch_add(1, Ordering::SeqCst);
        self.before_call(&self.fail_lists, "list").await?;
        self.inner.list(collection, query).await
    }

    async fn delete(&self, collection: Collection, id: &RecordId) -> Result<bool> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.before_call(&self.fail_deletes, "delete").await?;
        self.inner.delete(collection, id).await
    }

    async fn count(&self, collection: Collection) -> Result<usize> {
        let never = AtomicBool::new(false);
        self.before_call(&never, "count").await?;
        self.inner.count(collection).await
    }

    async fn delete_if_unchanged(&self, collection: Collection, expected: &Record) -> Result<ConditionalDelete> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.before_call(&self.fail_deletes, "delete").await?;
        self.inner.delete_if_unchanged(collection, expected).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use larder_types::Fields;

    #[tokio::test]
    async fn put_budget_then_failure() {
        let store = FaultyStore::new(MemoryStore::new(), Tier::Archive);
        store.fail_puts_after(1);

        store.put(Collection::Orders, &Record::new(Fields::new())).await.unwrap();
        let err = store
            .put(Collection::Orders, &Record::new(Fields::new()))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(store.put_count(), 2);
        assert_eq!(store.inner().count(Collection::Orders).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_puts_are_acknowledged_but_absent() {
        let store = FaultyStore::new(MemoryStore::new(), Tier::Archive);
        store.set_drop_puts(true);
        let record = Record::new(Fields::new());

        store.put(Collection::Orders, &record).await.unwrap();
        assert!(store.get(Collection::Orders, &record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heal_clears_faults() {
        let store = FaultyStore::new(MemoryStore::new(), Tier::Primary);
        store.set_fail_all(true);
        assert!(store.count(Collection::Users).await.is_err());

        store.heal();
        assert_eq!(store.count(Collection::Users).await.unwrap(), 0);
    }
}
