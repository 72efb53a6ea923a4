//! Storage tier configuration.
//!
//! All tunables are plain serde structs so they can be layered from
//! defaults, a config file and environment variables by the binary.

use crate::resilience::RetryPolicy;
use crate::{Result, StorageError};
use larder_types::Collection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Top-level storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Capacity monitor settings.
    #[validate(nested)]
    pub capacity: CapacityConfig,
    /// Migration engine settings.
    #[validate(nested)]
    pub migration: MigrationConfig,
    /// Query router settings.
    #[validate(nested)]
    pub router: RouterConfig,
    /// Retry policy for adapter calls.
    #[validate(nested)]
    pub retry: RetryConfig,
    /// Deadline for a single adapter call, in milliseconds.
    #[validate(range(min = 1))]
    pub op_timeout_ms: u64,
    /// Directory holding the archive sheets.
    pub archive_dir: PathBuf,
    /// File recording migration batches.
    pub journal_path: PathBuf,
    /// Snapshot file for the in-memory primary store.
    pub primary_snapshot: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity: CapacityConfig::default(),
            migration: MigrationConfig::default(),
            router: RouterConfig::default(),
            retry: RetryConfig::default(),
            op_timeout_ms: 5_000,
            archive_dir: PathBuf::from("./data/archive"),
            journal_path: PathBuf::from("./data/migrations.json"),
            primary_snapshot: Some(PathBuf::from("./data/primary.json")),
        }
    }
}

impl StorageConfig {
    /// Validates every section, returning a single readable error.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))
    }

    /// Per-call deadline.
    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Capacity limits for one collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionCapacity {
    /// Overrides [`CapacityConfig::max_capacity`].
    pub max_capacity: Option<usize>,
    /// Overrides [`CapacityConfig::threshold`].
    pub threshold: Option<usize>,
    /// Overrides [`CapacityConfig::threshold_fraction`].
    pub threshold_fraction: Option<f64>,
    /// Overrides [`CapacityConfig::hysteresis`].
    pub hysteresis: Option<f64>,
}

/// Capacity monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_capacity"))]
pub struct CapacityConfig {
    /// Configured maximum number of records per collection in primary.
    #[validate(range(min = 1))]
    pub max_capacity: usize,
    /// Absolute record count at which migration starts.
    #[validate(range(min = 1))]
    pub threshold: usize,
    /// If set, migration starts at this fraction of `max_capacity` instead.
    pub threshold_fraction: Option<f64>,
    /// Migration drains primary to `threshold * hysteresis`. Must be in (0, 1).
    #[validate(range(exclusive_min = 0.0, exclusive_max = 1.0))]
    pub hysteresis: f64,
    /// Reconcile the local counter against the store every N creates.
    #[validate(range(min = 1))]
    pub reconcile_every: u64,
    /// Quiet period after a failed migration, in milliseconds.
    pub failure_cooldown_ms: u64,
    /// Per-collection overrides.
    pub overrides: HashMap<Collection, CollectionCapacity>,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1_000,
            threshold: 900,
            threshold_fraction: None,
            hysteresis: 0.8,
            reconcile_every: 50,
            failure_cooldown_ms: 30_000,
            overrides: HashMap::new(),
        }
    }
}

/// Effective limits for one collection after applying overrides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedCapacity {
    /// Maximum capacity `M`.
    pub max_capacity: usize,
    /// Trigger level `T`.
    pub threshold: usize,
    /// Hysteresis factor.
    pub hysteresis: f64,
}

/// Fractions are resolved to basis points so common percentages such as
/// 0.07 land on the exact integer instead of one past it.
const BASIS_POINTS: u64 = 10_000;

fn basis_points(fraction: f64) -> u64 {
    (fraction * BASIS_POINTS as f64).round() as u64
}

/// Smallest count at or above `fraction` of `n`.
fn ceil_fraction(n: usize, fraction: f64) -> usize {
    (n as u64 * basis_points(fraction)).div_ceil(BASIS_POINTS) as usize
}

impl ResolvedCapacity {
    /// Highest live count strictly under `threshold * hysteresis`; a
    /// migration drains the collection to this level.
    #[must_use]
    pub fn drain_to(&self) -> usize {
        ceil_fraction(self.threshold, self.hysteresis).saturating_sub(1)
    }
}

impl CapacityConfig {
    /// Resolves the effective limits for `collection`.
    #[must_use]
    pub fn for_collection(&self, collection: Collection) -> ResolvedCapacity {
        let o = self.overrides.get(&collection).cloned().unwrap_or_default();
        let max_capacity = o.max_capacity.unwrap_or(self.max_capacity);
        let fraction = o.threshold_fraction.or(if o.threshold.is_some() {
            None
        } else {
            self.threshold_fraction
        });
        let threshold = match fraction {
            Some(f) => ceil_fraction(max_capacity, f),
            None => o.threshold.unwrap_or(self.threshold),
        };

        ResolvedCapacity {
            max_capacity,
            threshold: threshold.max(1),
            hysteresis: o.hysteresis.unwrap_or(self.hysteresis),
        }
    }
}

fn validate_capacity(config: &CapacityConfig) -> std::result::Result<(), ValidationError> {
    let valid_fraction = |f: Option<f64>| f.map_or(true, |f| f > 0.0 && f <= 1.0);
    let valid_hysteresis = |h: Option<f64>| h.map_or(true, |h| h > 0.0 && h < 1.0);

    if !valid_fraction(config.threshold_fraction) {
        return Err(ValidationError::new("threshold_fraction_out_of_range"));
    }
    for o in config.overrides.values() {
        if !valid_fraction(o.threshold_fraction) {
            return Err(ValidationError::new("threshold_fraction_out_of_range"));
        }
        if !valid_hysteresis(o.hysteresis) {
            return Err(ValidationError::new("hysteresis_out_of_range"));
        }
    }
    for collection in Collection::ALL {
        let resolved = config.for_collection(collection);
        if resolved.threshold > resolved.max_capacity {
            return Err(ValidationError::new("threshold_exceeds_max_capacity"));
        }
    }
    Ok(())
}

/// Migration engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MigrationConfig {
    /// Largest number of records moved in one batch.
    #[validate(range(min = 1))]
    pub max_batch_size: usize,
    /// Interval between background maintenance ticks, in milliseconds.
    #[validate(range(min = 1))]
    pub worker_tick_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            worker_tick_ms: 10_000,
        }
    }
}

/// Query router configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RouterConfig {
    /// Page size used when the caller does not give one.
    #[validate(range(min = 1))]
    pub default_page_size: usize,
    /// Largest page a caller may request.
    #[validate(range(min = 1))]
    pub max_page_size: usize,
    /// Rows fetched per archive call during a client-side filtered scan.
    #[validate(range(min = 1))]
    pub scan_page_size: usize,
    /// Rows a single `list` call may scan in the archive before returning
    /// a short page with a continuation token.
    #[validate(range(min = 1))]
    pub max_scan_rows: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 500,
            scan_page_size: 200,
            max_scan_rows: 5_000,
        }
    }
}

/// Retry configuration for adapter calls.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call, including the first.
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    /// First backoff delay, in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier.
    #[validate(range(min = 1.0))]
    pub multiplier: f64,
    /// Randomize delays by up to 25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}
