//! Capacity monitor.
//!
//! Tracks how full each primary collection is and decides when migration
//! should run. At most one migration per collection is outstanding at any
//! time; triggers raised while one is in flight are coalesced away.
//!
//! An outstanding migration is either queued (a trigger was raised and is
//! waiting for the worker) or running. A queued trigger can be taken over
//! by a forced run or a resume, so nothing ever waits on a worker that is
//! not there.

use crate::config::{CapacityConfig, ResolvedCapacity};
use larder_types::Collection;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Request to move records of one collection out of primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationTrigger {
    /// Collection to migrate.
    pub collection: Collection,
    /// Number of oldest records to move.
    pub target: usize,
    /// Raised by an operator rather than by the threshold.
    pub forced: bool,
}

/// What the monitor concluded from a create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateObservation {
    /// Migration to schedule, if the threshold was crossed.
    pub trigger: Option<MigrationTrigger>,
    /// The local counter is due for reconciliation with the store.
    pub reconcile_due: bool,
}

/// Point-in-time view of one collection's capacity state.
#[derive(Debug, Clone, Serialize)]
pub struct CapacitySnapshot {
    /// Collection described.
    pub collection: Collection,
    /// Locally tracked live record count in primary.
    pub live: usize,
    /// Trigger level.
    pub threshold: usize,
    /// Configured maximum capacity.
    pub max_capacity: usize,
    /// A migration is outstanding.
    pub in_flight: bool,
    /// Triggers are suppressed after a failed migration.
    pub cooling_down: bool,
}

#[derive(Debug, Default)]
struct CollectionState {
    live: usize,
    creates_since_reconcile: u64,
    /// Target of a raised trigger nobody has started yet.
    queued: Option<usize>,
    running: bool,
    cooldown_until: Option<Instant>,
}

impl CollectionState {
    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    fn in_flight(&self) -> bool {
        self.running || self.queued.is_some()
    }
}

/// Per-collection fill tracking and migration trigger policy.
#[derive(Debug)]
pub struct CapacityMonitor {
    config: CapacityConfig,
    states: Mutex<HashMap<Collection, CollectionState>>,
}

impl CapacityMonitor {
    /// Creates a monitor with every collection assumed empty.
    #[must_use]
    pub fn new(config: CapacityConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Effective limits for `collection`.
    #[must_use]
    pub fn limits(&self, collection: Collection) -> ResolvedCapacity {
        self.config.for_collection(collection)
    }

    fn evaluate(
        &self,
        collection: Collection,
        state: &mut CollectionState,
    ) -> Option<MigrationTrigger> {
        let limits = self.limits(collection);
        if state.in_flight() || state.cooling_down(Instant::now()) || state.live < limits.threshold {
            return None;
        }

        state.cooldown_until = None;
        let target = state.live.saturating_sub(limits.drain_to()).max(1);
        state.queued = Some(target);
        tracing::info!(
            %collection,
            live = state.live,
            threshold = limits.threshold,
            target,
            "Capacity threshold reached, scheduling migration"
        );
        Some(MigrationTrigger {
            collection,
            target,
            forced: false,
        })
    }

    /// Notes a successful create in primary.
    pub fn record_create(&self, collection: Collection) -> CreateObservation {
        let mut states = self.states.lock();
        let state = states.entry(collection).or_default();
        state.live += 1;
        state.creates_since_reconcile += 1;

        let reconcile_due = state.creates_since_reconcile >= self.config.reconcile_every;
        CreateObservation {
            trigger: self.evaluate(collection, state),
            reconcile_due,
        }
    }

    /// Notes a record removed from primary outside of migration.
    pub fn record_delete(&self, collection: Collection) {
        let mut states = self.states.lock();
        let state = states.entry(collection).or_default();
        state.live = state.live.saturating_sub(1);
    }

    /// Replaces the local counter with the store's count.
    pub fn reconcile(&self, collection: Collection, count: usize) -> Option<MigrationTrigger> {
        let mut states = self.states.lock();
        let state = states.entry(collection).or_default();
        if state.live != count {
            tracing::debug!(%collection, local = state.live, store = count, "Reconciled capacity counter");
        }
        state.live = count;
        state.creates_since_reconcile = 0;
        self.evaluate(collection, state)
    }

    /// Starts the queued trigger of `collection`.
    ///
    /// Returns `None` if nothing is queued, either because a forced run or
    /// a resume took the trigger over, or because a migration is running.
    pub fn begin_queued(&self, collection: Collection) -> Option<MigrationTrigger> {
        let mut states = self.states.lock();
        let state = states.get_mut(&collection)?;
        if state.running {
            return None;
        }
        let target = state.queued.take()?;
        state.running = true;
        Some(MigrationTrigger {
            collection,
            target,
            forced: false,
        })
    }

    /// Claims the collection for an operator-forced migration of `size`
    /// records, ignoring threshold and cooldown. A queued trigger is taken
    /// over.
    ///
    /// Returns `None` if a migration is already running.
    pub fn try_begin_forced(&self, collection: Collection, size: usize) -> Option<MigrationTrigger> {
        self.try_claim(collection).then_some(MigrationTrigger {
            collection,
            target: size,
            forced: true,
        })
    }

    /// Marks a migration running for `collection` unless one already is,
    /// taking over any queued trigger.
    ///
    /// Used before resuming a journaled batch, so resumption never overlaps
    /// a live migration of the same collection.
    pub fn try_claim(&self, collection: Collection) -> bool {
        let mut states = self.states.lock();
        let state = states.entry(collection).or_default();
        if state.running {
            return false;
        }
        if let Some(target) = state.queued.take() {
            tracing::debug!(%collection, target, "Queued migration taken over");
        }
        state.running = true;
        true
    }

    /// Releases the collection after a migration moved `moved` records.
    ///
    /// Returns a fresh trigger if records moved and the collection is still
    /// at its threshold. A run that moved nothing leaves re-triggering to
    /// the next reconcile.
    pub fn complete(&self, collection: Collection, moved: usize) -> Option<MigrationTrigger> {
        let mut states = self.states.lock();
        let state = states.entry(collection).or_default();
        state.running = false;
        if moved == 0 {
            return None;
        }
        state.live = state.live.saturating_sub(moved);
        self.evaluate(collection, state)
    }

    /// Drops a queued trigger that can no longer be delivered.
    pub fn abandon(&self, collection: Collection) {
        if let Some(state) = self.states.lock().get_mut(&collection) {
            state.queued = None;
        }
    }

    /// Releases the collection after a failed migration and starts the cooldown.
    pub fn fail(&self, collection: Collection, moved: usize) {
        let mut states = self.states.lock();
        let state = states.entry(collection).or_default();
        state.running = false;
        state.live = state.live.saturating_sub(moved);
        state.cooldown_until =
            Some(Instant::now() + Duration::from_millis(self.config.failure_cooldown_ms));
    }

    /// Returns true if a migration is outstanding for `collection`.
    #[must_use]
    pub fn is_in_flight(&self, collection: Collection) -> bool {
        self.states
            .lock()
            .get(&collection)
            .is_some_and(CollectionState::in_flight)
    }

    /// Snapshot of every collection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CapacitySnapshot> {
        let now = Instant::now();
        let states = self.states.lock();
        Collection::ALL
            .iter()
            .map(|&collection| {
                let limits = self.limits(collection);
                let state = states.get(&collection);
                CapacitySnapshot {
                    collection,
                    live: state.map_or(0, |s| s.live),
                    threshold: limits.threshold,
                    max_capacity: limits.max_capacity,
                    in_flight: state.is_some_and(CollectionState::in_flight),
                    cooling_down: state.is_some_and(|s| s.cooling_down(now)),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(threshold: usize, hysteresis: f64) -> CapacityMonitor {
        CapacityMonitor::new(CapacityConfig {
            max_capacity: 100,
            threshold,
            hysteresis,
            reconcile_every: 1_000,
            failure_cooldown_ms: 60_000,
            ..CapacityConfig::default()
        })
    }

    #[test]
    fn triggers_once_at_threshold() {
        let monitor = monitor(90, 0.8);

        for _ in 0..89 {
            assert!(monitor.record_create(Collection::Orders).trigger.is_none());
        }
        let trigger = monitor.record_create(Collection::Orders).trigger.unwrap();
        assert_eq!(trigger.collection, Collection::Orders);
        // Under 90 * 0.8 = 72 means 71.
        assert_eq!(trigger.target, 90 - 71);

        // 91st create while the batch is in flight is coalesced.
        assert!(monitor.record_create(Collection::Orders).trigger.is_none());
        assert!(monitor.is_in_flight(Collection::Orders));
    }

    #[test]
    fn collections_are_independent() {
        let monitor = monitor(2, 0.5);
        monitor.record_create(Collection::Orders);
        assert!(monitor.record_create(Collection::Orders).trigger.is_some());
        assert!(monitor.record_create(Collection::Users).trigger.is_none());
    }

    #[test]
    fn hysteresis_prevents_immediate_retrigger() {
        let monitor = monitor(10, 0.5);
        for _ in 0..9 {
            monitor.record_create(Collection::Users);
        }
        monitor.record_create(Collection::Users).trigger.unwrap();
        let trigger = monitor.begin_queued(Collection::Users).unwrap();
        assert!(monitor.complete(Collection::Users, trigger.target).is_none());

        // Drained to 4; the next create lands at 5, well under the threshold.
        assert!(monitor.record_create(Collection::Users).trigger.is_none());
    }

    #[test]
    fn failure_starts_cooldown() {
        let monitor = monitor(1, 0.5);
        let trigger = monitor.record_create(Collection::Orders).trigger.unwrap();
        monitor.begin_queued(Collection::Orders).unwrap();
        monitor.fail(Collection::Orders, 0);

        assert!(!monitor.is_in_flight(Collection::Orders));
        assert!(monitor.record_create(Collection::Orders).trigger.is_none());
        assert!(monitor.snapshot()[0].cooling_down);
        assert!(trigger.target >= 1);
    }

    #[test]
    fn queued_trigger_starts_once() {
        let monitor = monitor(2, 0.5);
        monitor.record_create(Collection::Orders);
        let raised = monitor.record_create(Collection::Orders).trigger.unwrap();

        let started = monitor.begin_queued(Collection::Orders).unwrap();
        assert_eq!(started, raised);
        assert!(monitor.begin_queued(Collection::Orders).is_none());
        assert!(monitor.try_begin_forced(Collection::Orders, 10).is_none());
    }

    #[test]
    fn forced_run_takes_over_queued_trigger() {
        let monitor = monitor(2, 0.5);
        monitor.record_create(Collection::Orders);
        assert!(monitor.record_create(Collection::Orders).trigger.is_some());

        let forced = monitor.try_begin_forced(Collection::Orders, 10).unwrap();
        assert!(forced.forced);
        // The parked wake-up for the queued trigger is now stale.
        assert!(monitor.begin_queued(Collection::Orders).is_none());

        assert!(monitor.complete(Collection::Orders, 2).is_none());
        assert!(!monitor.is_in_flight(Collection::Orders));
    }

    #[test]
    fn completion_retriggers_while_still_over_threshold() {
        let monitor = monitor(4, 0.5);
        for _ in 0..6 {
            monitor.record_create(Collection::Users);
        }
        monitor.try_begin_forced(Collection::Users, 1).unwrap();

        // One record moved leaves 5; under 4 * 0.5 = 2 means 1.
        let next = monitor.complete(Collection::Users, 1).unwrap();
        assert_eq!(next.target, 5 - 1);
        assert!(monitor.is_in_flight(Collection::Users));
    }

    #[test]
    fn forced_migration_respects_in_flight() {
        let monitor = monitor(90, 0.8);
        assert!(monitor.try_begin_forced(Collection::MenuItems, 10).is_some());
        assert!(monitor.try_begin_forced(Collection::MenuItems, 10).is_none());
        monitor.complete(Collection::MenuItems, 0);
        assert!(monitor.try_begin_forced(Collection::MenuItems, 10).is_some());
    }

    #[test]
    fn reconcile_corrects_drift_and_can_trigger() {
        let monitor = monitor(5, 0.8);
        monitor.record_create(Collection::Orders);
        assert!(monitor.reconcile(Collection::Orders, 7).is_some());
        assert_eq!(monitor.snapshot()[0].live, 7);
    }
}
