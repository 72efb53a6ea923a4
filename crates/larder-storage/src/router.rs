//! Query router.
//!
//! Serves reads as if both tiers were one store. Lookups by id consult
//! primary first and fall back to the archive. Listings query both tiers
//! concurrently and merge the results by [`SortKey`], deduplicating records
//! that sit in both tiers during a migration (primary's copy wins).
//!
//! When the archive cannot evaluate a filter natively, the router pushes
//! down what it can and filters the remainder client-side, scanning at most
//! `max_scan_rows` rows per call. A scan that runs out of budget returns a
//! short page whose token resumes where the scan stopped; archive rows are
//! never skipped to keep a page fast.
//!
//! Page tokens carry one cursor per tier so a merged listing can resume
//! correctly. They are bound to the filter and order that produced them.

use crate::adapter::{ListQuery, StoreAdapter, Tier};
use crate::config::RouterConfig;
use crate::resilience::CallPolicy;
use crate::stats::TierStats;
use crate::{Result, StorageError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use larder_types::{Collection, Filter, Record, RecordId, SortKey, SortOrder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Request for one page of a merged listing.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Records must match every predicate.
    pub filter: Filter,
    /// Listing direction.
    pub order: SortOrder,
    /// Page size; the router default applies when absent.
    pub limit: Option<usize>,
    /// Token returned by the previous page.
    pub page_token: Option<String>,
}

impl ListRequest {
    /// Lists everything, oldest first.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the order.
    #[must_use]
    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Sets the page size.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Continues from a previous page.
    #[must_use]
    pub fn with_page_token(mut self, token: Option<String>) -> Self {
        self.page_token = token;
        self
    }
}

/// One page of a merged listing.
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    /// Records in the requested order.
    pub records: Vec<Record>,
    /// Token for the next page; `None` when the listing is exhausted.
    pub next_page_token: Option<String>,
    /// The archive was unreachable; archived records may be missing.
    pub degraded: bool,
}

/// Position of one tier within a merged listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", content = "key", rename_all = "snake_case")]
enum Cursor {
    Start,
    After(SortKey),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PageToken {
    primary: Cursor,
    archive: Cursor,
    order: SortOrder,
    filter: String,
}

impl PageToken {
    fn start(order: SortOrder, filter: String) -> Self {
        Self {
            primary: Cursor::Start,
            archive: Cursor::Start,
            order,
            filter,
        }
    }

    fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    fn decode(raw: &str, order: SortOrder, filter: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| StorageError::InvalidPageToken(e.to_string()))?;
        let token: PageToken = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::InvalidPageToken(e.to_string()))?;

        if token.order != order {
            return Err(StorageError::InvalidPageToken(
                "token was issued for a different order".into(),
            ));
        }
        if token.filter != filter {
            return Err(StorageError::InvalidPageToken(
                "token was issued for a different filter".into(),
            ));
        }
        Ok(token)
    }
}

fn fingerprint(filter: &Filter) -> Result<String> {
    let digest = Sha256::digest(serde_json::to_vec(filter)?);
    Ok(hex::encode(&digest[..8]))
}

/// Compares keys by position in a listing of the given order.
fn in_order(order: SortOrder, a: &SortKey, b: &SortKey) -> Ordering {
    match order {
        SortOrder::Ascending => a.cmp(b),
        SortOrder::Descending => b.cmp(a),
    }
}

/// Merges two runs already sorted in `order`.
///
/// A record present in both runs has the same [`SortKey`] in each; the
/// primary copy is kept.
pub(crate) fn merge_sorted<'a>(
    primary: &'a [Record],
    archive: &'a [Record],
    order: SortOrder,
) -> Vec<&'a Record> {
    let mut merged = Vec::with_capacity(primary.len() + archive.len());
    let (mut p, mut a) = (0, 0);

    while p < primary.len() && a < archive.len() {
        match in_order(order, &primary[p].sort_key(), &archive[a].sort_key()) {
            Ordering::Less => {
                merged.push(&primary[p]);
                p += 1;
            }
            Ordering::Greater => {
                merged.push(&archive[a]);
                a += 1;
            }
            Ordering::Equal => {
                merged.push(&primary[p]);
                p += 1;
                a += 1;
            }
        }
    }
    merged.extend(&primary[p..]);
    merged.extend(&archive[a..]);
    merged
}

/// Candidates fetched from one tier.
#[derive(Debug, Default)]
struct TierPage {
    /// Matching records past the cursor, in order.
    candidates: Vec<Record>,
    /// Last key examined, when the tier holds more beyond it.
    scanned_to: Option<SortKey>,
    /// Nothing remains past the candidates.
    exhausted: bool,
}

impl TierPage {
    fn exhausted() -> Self {
        Self {
            exhausted: true,
            ..Self::default()
        }
    }

    /// Cursor for the next page given the last emitted key.
    fn advance(&self, old: &Cursor, last: Option<&SortKey>, order: SortOrder) -> Cursor {
        if *old == Cursor::Done {
            return Cursor::Done;
        }
        let remaining = self.candidates.iter().any(|r| {
            last.map_or(true, |l| in_order(order, &r.sort_key(), l) == Ordering::Greater)
        });
        if remaining {
            return match last {
                Some(last) => resume_from(old, last, order),
                None => old.clone(),
            };
        }
        if self.exhausted {
            return Cursor::Done;
        }
        match &self.scanned_to {
            Some(key) => Cursor::After(key.clone()),
            None => old.clone(),
        }
    }
}

/// The later of the current cursor and `last`.
fn resume_from(old: &Cursor, last: &SortKey, order: SortOrder) -> Cursor {
    match old {
        Cursor::Done => Cursor::Done,
        Cursor::After(key) if in_order(order, key, last) == Ordering::Greater => old.clone(),
        _ => Cursor::After(last.clone()),
    }
}

/// Routes reads across the primary and archive tiers.
pub struct QueryRouter {
    primary: Arc<dyn StoreAdapter>,
    archive: Arc<dyn StoreAdapter>,
    primary_calls: CallPolicy,
    archive_calls: CallPolicy,
    config: RouterConfig,
    stats: Arc<TierStats>,
}

impl QueryRouter {
    pub(crate) fn new(
        primary: Arc<dyn StoreAdapter>,
        archive: Arc<dyn StoreAdapter>,
        primary_calls: CallPolicy,
        archive_calls: CallPolicy,
        config: RouterConfig,
        stats: Arc<TierStats>,
    ) -> Self {
        Self {
            primary,
            archive,
            primary_calls,
            archive_calls,
            config,
            stats,
        }
    }

    fn tier(&self, tier: Tier) -> (&Arc<dyn StoreAdapter>, &CallPolicy) {
        match tier {
            Tier::Primary => (&self.primary, &self.primary_calls),
            Tier::Archive => (&self.archive, &self.archive_calls),
        }
    }

    /// Fetches a record by id, primary first.
    ///
    /// If primary misses and the archive cannot be reached the result is
    /// [`StorageError::ArchiveDegraded`] rather than `NotFound`, since the
    /// record may exist only in the archive. If primary is unreachable the
    /// archive still answers; a miss there surfaces primary's error.
    pub async fn get(&self, collection: Collection, id: &RecordId) -> Result<Record> {
        let primary_error = match self
            .primary_calls
            .call("get", || self.primary.get(collection, id))
            .await
        {
            Ok(Some(record)) => {
                TierStats::bump(&self.stats.primary_hits);
                return Ok(record);
            }
            Ok(None) => None,
            Err(e) if e.is_retryable() => {
                tracing::warn!(%collection, %id, error = %e, "Primary unreachable, trying archive");
                Some(e)
            }
            Err(e) => return Err(e),
        };

        match self
            .archive_calls
            .call("get", || self.archive.get(collection, id))
            .await
        {
            Ok(Some(record)) => {
                tracing::debug!(%collection, %id, "Record served from archive");
                TierStats::bump(&self.stats.archive_hits);
                Ok(record)
            }
            Ok(None) => match primary_error {
                Some(e) => Err(e),
                None => Err(StorageError::NotFound {
                    collection,
                    id: id.clone(),
                }),
            },
            Err(e) if e.is_retryable() => {
                if let Some(primary_error) = primary_error {
                    return Err(primary_error);
                }
                tracing::warn!(%collection, %id, error = %e, "Archive unreachable after primary miss");
                TierStats::bump(&self.stats.degraded_reads);
                Err(StorageError::ArchiveDegraded {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Lists one merged page.
    pub async fn list(&self, collection: Collection, request: &ListRequest) -> Result<ListResult> {
        self.list_cancellable(collection, request, &CancellationToken::new())
            .await
    }

    /// Lists one merged page, abandoning the scan if `cancel` fires.
    ///
    /// Listing is read-only, so a cancelled call leaves nothing behind.
    pub async fn list_cancellable(
        &self,
        collection: Collection,
        request: &ListRequest,
        cancel: &CancellationToken,
    ) -> Result<ListResult> {
        let order = request.order;
        let limit = request
            .limit
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size);
        let filter_id = fingerprint(&request.filter)?;
        let token = match &request.page_token {
            Some(raw) => PageToken::decode(raw, order, &filter_id)?,
            None => PageToken::start(order, filter_id),
        };

        let (primary, archive) = tokio::join!(
            self.fetch(Tier::Primary, collection, request, &token.primary, limit, cancel),
            self.fetch(Tier::Archive, collection, request, &token.archive, limit, cancel),
        );
        let primary = primary?;
        let (archive, degraded) = match archive {
            Ok(page) => (page, false),
            Err(e) if e.is_retryable() => {
                tracing::warn!(%collection, error = %e, "Archive unreachable, listing primary only");
                TierStats::bump(&self.stats.degraded_reads);
                (TierPage::exhausted(), true)
            }
            Err(e) => return Err(e),
        };

        // Nothing past the earliest unfinished tier frontier can be emitted:
        // that tier may still hold records sorting before it.
        let bound = [&primary, &archive]
            .into_iter()
            .filter(|page| !page.exhausted)
            .filter_map(|page| page.scanned_to.as_ref())
            .min_by(|a, b| in_order(order, a, b));

        let records: Vec<Record> = merge_sorted(&primary.candidates, &archive.candidates, order)
            .into_iter()
            .take_while(|r| bound.map_or(true, |b| in_order(order, &r.sort_key(), b) != Ordering::Greater))
            .take(limit)
            .cloned()
            .collect();

        let last = records.last().map(Record::sort_key);
        let next = PageToken {
            primary: primary.advance(&token.primary, last.as_ref(), order),
            archive: if degraded {
                match &last {
                    Some(last) => resume_from(&token.archive, last, order),
                    None => token.archive.clone(),
                }
            } else {
                archive.advance(&token.archive, last.as_ref(), order)
            },
            order,
            filter: token.filter,
        };

        let next_page_token = if next.primary == Cursor::Done && next.archive == Cursor::Done {
            None
        } else {
            Some(next.encode()?)
        };

        if records.len() < limit && next_page_token.is_some() {
            tracing::debug!(%collection, returned = records.len(), limit, "Returning short page");
        }

        Ok(ListResult {
            records,
            next_page_token,
            degraded,
        })
    }

    /// Fetches at least `want` matching candidates from one tier, or as many
    /// as the scan budget allows.
    async fn fetch(
        &self,
        tier: Tier,
        collection: Collection,
        request: &ListRequest,
        cursor: &Cursor,
        want: usize,
        cancel: &CancellationToken,
    ) -> Result<TierPage> {
        let after = match cursor {
            Cursor::Done => return Ok(TierPage::exhausted()),
            Cursor::Start => None,
            Cursor::After(key) => Some(key.clone()),
        };
        let (store, calls) = self.tier(tier);

        let pushed = request.filter.pushdown(store.filter_support());
        let native = pushed == request.filter;
        if !native {
            tracing::debug!(
                %collection,
                %tier,
                store = store.name(),
                "Filter exceeds store support, scanning with client-side filtering"
            );
        }

        let mut query = ListQuery {
            filter: pushed,
            order: request.order,
            after,
            limit: if native { want } else { self.config.scan_page_size },
        };
        let mut page = TierPage::default();
        let mut scanned = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                result = calls.call("list", || store.list(collection, &query)) => result?,
            };

            scanned += result.records.len();
            page.candidates.extend(
                result
                    .records
                    .into_iter()
                    .filter(|r| native || request.filter.matches(r)),
            );

            let Some(next) = result.next else {
                page.exhausted = true;
                return Ok(page);
            };
            if page.candidates.len() >= want || scanned >= self.config.max_scan_rows {
                if page.candidates.len() < want {
                    tracing::debug!(%collection, %tier, scanned, "Scan budget exhausted");
                }
                page.scanned_to = Some(next);
                return Ok(page);
            }
            query.after = Some(next);
        }
    }
}
