//! Storage error types.

use crate::adapter::Tier;
use crate::journal::BatchStatus;
use larder_types::{Collection, RecordId};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The record is absent from every tier.
    #[error("not found: {collection} record '{id}'")]
    NotFound {
        /// Collection that was searched.
        collection: Collection,
        /// Identifier that was requested.
        id: RecordId,
    },

    /// A tier's adapter call failed transiently.
    #[error("{tier} store unavailable: {reason}")]
    StoreUnavailable {
        /// Tier whose adapter failed.
        tier: Tier,
        /// Adapter-supplied reason.
        reason: String,
    },

    /// An adapter call exceeded its deadline.
    #[error("{tier} store timed out after {timeout:?}")]
    StoreTimeout {
        /// Tier whose adapter timed out.
        tier: Tier,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// A migration batch stopped before reaching its final state.
    ///
    /// Used by the migration engine to resume at the right step; the facade
    /// never returns it to callers.
    #[error("migration batch {batch_id} incomplete at {status:?}")]
    MigrationIncomplete {
        /// Batch that stopped.
        batch_id: uuid::Uuid,
        /// Last durable status of the batch.
        status: BatchStatus,
    },

    /// The archive is unreachable and the answer may exist only there.
    #[error("archive degraded: {reason}")]
    ArchiveDegraded {
        /// Why the archive could not be consulted.
        reason: String,
    },

    /// The store's hard capacity is exhausted.
    #[error("{tier} store full")]
    StorageFull {
        /// Tier that is full.
        tier: Tier,
    },

    /// The adapter cannot evaluate the given filter.
    #[error("filter not supported by {store}")]
    UnsupportedFilter {
        /// Adapter name.
        store: &'static str,
    },

    /// A page token could not be decoded or does not belong to this query.
    #[error("invalid page token: {0}")]
    InvalidPageToken(String),

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Creates an unavailable error for the given tier.
    pub fn unavailable(tier: Tier, reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            tier,
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    ///
    /// Timeouts count as unavailability for retry purposes.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::StoreUnavailable { .. } | StorageError::StoreTimeout { .. }
        )
    }
}

/// A specialized Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable() {
        let err = StorageError::StoreTimeout {
            tier: Tier::Archive,
            timeout: Duration::from_millis(5),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "archive store timed out after 5ms");
    }

    #[test]
    fn not_found_is_final() {
        let err = StorageError::NotFound {
            collection: Collection::Orders,
            id: "o-1".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "not found: orders record 'o-1'");
    }
}
