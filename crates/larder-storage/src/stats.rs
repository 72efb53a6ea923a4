//! Tier statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the router, the facade and the migration worker.
#[derive(Debug, Default)]
pub(crate) struct TierStats {
    pub(crate) primary_hits: AtomicU64,
    pub(crate) archive_hits: AtomicU64,
    pub(crate) degraded_reads: AtomicU64,
    pub(crate) migrations_scheduled: AtomicU64,
    pub(crate) migrations_completed: AtomicU64,
    pub(crate) migrations_failed: AtomicU64,
    pub(crate) records_archived: AtomicU64,
}

impl TierStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            primary_hits: self.primary_hits.load(Ordering::Relaxed),
            archive_hits: self.archive_hits.load(Ordering::Relaxed),
            degraded_reads: self.degraded_reads.load(Ordering::Relaxed),
            migrations_scheduled: self.migrations_scheduled.load(Ordering::Relaxed),
            migrations_completed: self.migrations_completed.load(Ordering::Relaxed),
            migrations_failed: self.migrations_failed.load(Ordering::Relaxed),
            records_archived: self.records_archived.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of tier statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// `get` calls answered by primary.
    pub primary_hits: u64,
    /// `get` calls answered by the archive.
    pub archive_hits: u64,
    /// Reads served without the archive because it was unreachable.
    pub degraded_reads: u64,
    /// Migration batches started.
    pub migrations_scheduled: u64,
    /// Migration batches that removed their records from primary.
    pub migrations_completed: u64,
    /// Migration batches that failed or stopped early.
    pub migrations_failed: u64,
    /// Records moved to the archive.
    pub records_archived: u64,
}

impl StatsSnapshot {
    /// Fraction of successful `get` calls answered by primary.
    #[must_use]
    pub fn primary_hit_ratio(&self) -> f64 {
        let total = self.primary_hits + self.archive_hits;
        if total == 0 {
            0.0
        } else {
            self.primary_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio() {
        let stats = TierStats::default();
        assert_eq!(stats.snapshot().primary_hit_ratio(), 0.0);

        TierStats::add(&stats.primary_hits, 3);
        TierStats::bump(&stats.archive_hits);
        assert_eq!(stats.snapshot().primary_hit_ratio(), 0.75);
    }
}
