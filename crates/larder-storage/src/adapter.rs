//! Store adapter contract.
//!
//! Defines the minimal CRUD interface every backing store must implement,
//! so that any document database, row store or key-value store can be
//! plugged in as either tier.

use crate::Result;
use async_trait::async_trait;
use larder_types::{Collection, Filter, FilterSupport, Record, RecordId, SortKey, SortOrder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The two storage tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Fast, capacity-bounded store for hot records.
    Primary,
    /// Slow, effectively unbounded store for historical records.
    Archive,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Primary => f.write_str("primary"),
            Tier::Archive => f.write_str("archive"),
        }
    }
}

/// A keyset-paginated listing request.
#[derive(Debug, Clone)]
pub struct ListQuery {
    /// Predicates the store must evaluate. Never exceeds the store's
    /// [`FilterSupport`].
    pub filter: Filter,
    /// Listing direction.
    pub order: SortOrder,
    /// Resume strictly after this key (in `order` direction).
    pub after: Option<SortKey>,
    /// Maximum number of records to return. Must be at least 1.
    pub limit: usize,
}

impl ListQuery {
    /// Lists everything in ascending order, `limit` records at a time.
    #[must_use]
    pub fn scan(limit: usize) -> Self {
        Self {
            filter: Filter::default(),
            order: SortOrder::Ascending,
            after: None,
            limit,
        }
    }

    /// Returns the same query resumed after `key`.
    #[must_use]
    pub fn resume_after(mut self, key: Option<SortKey>) -> Self {
        self.after = key;
        self
    }

    /// Returns true if `key` lies beyond the resume point.
    fn is_past_cursor(&self, key: &SortKey) -> bool {
        match (&self.after, self.order) {
            (None, _) => true,
            (Some(after), SortOrder::Ascending) => key > after,
            (Some(after), SortOrder::Descending) => key < after,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records in the requested order.
    pub records: Vec<Record>,
    /// Continuation key; `None` when the listing is exhausted.
    pub next: Option<SortKey>,
}

/// Builds a page from records already sorted by ascending [`SortKey`].
pub(crate) fn collect_page<'a, I>(sorted: I, query: &ListQuery) -> Page
where
    I: DoubleEndedIterator<Item = &'a Record>,
{
    let candidates: Box<dyn Iterator<Item = &'a Record>> = match query.order {
        SortOrder::Ascending => Box::new(sorted),
        SortOrder::Descending => Box::new(sorted.rev()),
    };

    let mut records: Vec<Record> = candidates
        .filter(|r| query.is_past_cursor(&r.sort_key()))
        .filter(|r| query.filter.matches(r))
        .take(query.limit.saturating_add(1))
        .cloned()
        .collect();

    let next = if records.len() > query.limit {
        records.truncate(query.limit);
        records.last().map(Record::sort_key)
    } else {
        None
    };

    Page { records, next }
}

/// Outcome of [`StoreAdapter::delete_if_unchanged`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalDelete {
    /// The stored copy matched and was removed.
    Deleted,
    /// The stored copy differs; nothing was removed.
    Changed(Record),
    /// Nothing is stored under the id.
    Absent,
}

/// Trait for the backing stores of either tier.
///
/// Implementations must make `put` an idempotent upsert by record id and
/// `delete` idempotent (removing an absent record is not an error).
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// How much of a filter this store evaluates natively.
    fn filter_support(&self) -> FilterSupport;

    /// Inserts or replaces a record.
    async fn put(&self, collection: Collection, record: &Record) -> Result<()>;

    /// Retrieves a record by id.
    async fn get(&self, collection: Collection, id: &RecordId) -> Result<Option<Record>>;

    /// Lists one page of matching records.
    async fn list(&self, collection: Collection, query: &ListQuery) -> Result<Page>;

    /// Deletes a record. Returns true if something was removed.
    async fn delete(&self, collection: Collection, id: &RecordId) -> Result<bool>;

    /// Approximate number of live records.
    async fn count(&self, collection: Collection) -> Result<usize>;

    /// Deletes the record only if the stored copy equals `expected`.
    ///
    /// The default reads and deletes in two calls, so a write landing
    /// between them is lost. Stores that can compare and delete atomically
    /// should override it.
    async fn delete_if_unchanged(&self, collection: Collection, expected: &Record) -> Result<ConditionalDelete> {
        match self.get(collection, &expected.id).await? {
            None => Ok(ConditionalDelete::Absent),
            Some(current) if current != *expected => Ok(ConditionalDelete::Changed(current)),
            Some(_) => Ok(if self.delete(collection, &expected.id).await? {
                ConditionalDelete::Deleted
            } else {
                ConditionalDelete::Absent
            }),
        }
    }

    /// Flushes pending writes to durable storage.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: StoreAdapter + ?Sized> StoreAdapter for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn filter_support(&self) -> FilterSupport {
        (**self).filter_support()
    }

    async fn put(&self, collection: Collection, record: &Record) -> Result<()> {
        (**self).put(collection, record).await
    }

    async fn get(&self, collection: Collection, id: &RecordId) -> Result<Option<Record>> {
        (**self).get(collection, id).await
    }

    async fn list(&self, collection: Collection, query: &ListQuery) -> Result<Page> {
        (**self).list(collection, query).await
    }

    async fn delete(&self, collection: Collection, id: &RecordId) -> Result<bool> {
        (**self).delete(collection, id).await
    }

    async fn count(&self, collection: Collection) -> Result<usize> {
        (**self).count(collection).await
    }

    async fn delete_if_unchanged(&self, collection: Collection, expected: &Record) -> Result<ConditionalDelete> {
        (**self).delete_if_unchanged(collection, expected).await
    }

    async fn flush(&self) -> Result<()> {
        (**self).flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_types::{Fields, Timestamp};

    fn records(times: &[i64]) -> Vec<Record> {
        times
            .iter()
            .map(|t| {
                Record::with_identity(
                    RecordId::new(format!("r{t}")),
                    Timestamp::from_millis(*t),
                    Fields::new(),
                )
            })
            .collect()
    }

    fn times(page: &Page) -> Vec<i64> {
        page.records.iter().map(|r| r.created_at.as_millis()).collect()
    }

    #[test]
    fn collect_page_ascending_with_continuation() {
        let all = records(&[1, 2, 3, 4, 5]);
        let query = ListQuery::scan(2);

        let first = collect_page(all.iter(), &query);
        assert_eq!(times(&first), vec![1, 2]);

        let second = collect_page(all.iter(), &query.clone().resume_after(first.next));
        assert_eq!(times(&second), vec![3, 4]);

        let third = collect_page(all.iter(), &query.resume_after(second.next));
        assert_eq!(times(&third), vec![5]);
        assert!(third.next.is_none());
    }

    #[test]
    fn collect_page_descending() {
        let all = records(&[1, 2, 3]);
        let query = ListQuery {
            order: SortOrder::Descending,
            ..ListQuery::scan(2)
        };

        let first = collect_page(all.iter(), &query);
        assert_eq!(times(&first), vec![3, 2]);

        let second = collect_page(all.iter(), &query.resume_after(first.next));
        assert_eq!(times(&second), vec![1]);
        assert!(second.next.is_none());
    }

    #[test]
    fn exact_fit_reports_exhaustion() {
        let all = records(&[1, 2]);
        let page = collect_page(all.iter(), &ListQuery::scan(2));
        assert_eq!(page.records.len(), 2);
        assert!(page.next.is_none());
    }
}
