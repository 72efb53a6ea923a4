//! # Larder Storage
//!
//! Hybrid storage tier for Larder's operational records.
//!
//! Records live in a fast, capacity-bounded primary store. When a collection
//! fills past its threshold, the oldest records are migrated to a slower,
//! effectively unbounded archive store. Callers see one logical dataset
//! through [`HybridStore`] and never learn which tier served a record.
//!
//! ## Components
//!
//! - [`StoreAdapter`]: the CRUD contract each backing store satisfies
//! - [`MemoryStore`] and [`SheetStore`]: primary- and archive-grade adapters
//! - [`CapacityMonitor`]: decides when a collection needs migrating
//! - [`MigrationEngine`]: moves batches without ever losing a record
//! - [`QueryRouter`]: reads across both tiers and merges listings
//! - [`HybridStore`]: the facade composing all of the above

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod capacity;
mod config;
mod error;
mod fault;
mod hybrid;
mod journal;
mod memory;
mod migration;
mod resilience;
mod router;
mod sheet;
mod stats;

pub use adapter::{ConditionalDelete, ListQuery, Page, StoreAdapter, Tier};
pub use capacity::{CapacityMonitor, CapacitySnapshot, CreateObservation, MigrationTrigger};
pub use config::{
    CapacityConfig, CollectionCapacity, MigrationConfig, ResolvedCapacity, RetryConfig,
    RouterConfig, StorageConfig,
};
pub use error::{Result, StorageError};
pub use fault::FaultyStore;
pub use hybrid::HybridStore;
pub use journal::{BatchJournal, BatchStatus, FileJournal, MemoryJournal, MigrationBatch};
pub use memory::MemoryStore;
pub use migration::{MigrationEngine, MigrationReport};
pub use resilience::{with_timeout, CallPolicy, RetryPolicy};
pub use router::{ListRequest, ListResult, QueryRouter};
pub use sheet::SheetStore;
pub use stats::StatsSnapshot;
