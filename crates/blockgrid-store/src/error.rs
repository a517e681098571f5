//! Error types for the Blockgrid store
//!
//! A failed store operation leaves the store observably unchanged. Lookups
//! that find nothing return `None`, never an error.

use blockgrid_storage::{CellId, StorageError};
use thiserror::Error;

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// The persistence layer failed to read or write
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// A connection endpoint has no live cell
    #[error("Dangling reference: connection {from} -> {to} references a missing cell")]
    DanglingReference {
        /// Source cell id
        from: CellId,
        /// Target cell id
        to: CellId,
    },

    /// Import signature does not match the bundle contents
    #[error("Integrity error: bundle signature {expected} does not match computed {actual}")]
    Integrity {
        /// Signature carried by the bundle
        expected: String,
        /// Signature recomputed from the bundle contents
        actual: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation cancelled before it committed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An import bundle is internally inconsistent
    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    /// Restoring a removed cell failed
    #[error("Recovery error: {0}")]
    Recovery(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Check if the error came from the persistence layer
    pub fn is_persistence_error(&self) -> bool {
        matches!(self, StoreError::Persistence(_))
    }

    /// Check if the error is an integrity failure on import
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, StoreError::Integrity { .. })
    }

    /// Check if the error is a dangling connection reference
    pub fn is_dangling_reference(&self) -> bool {
        matches!(self, StoreError::DanglingReference { .. })
    }

    /// Check if the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled(_))
    }

    /// Stable error code for callers that surface errors to users
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::Persistence(_) => "ERR_STORE_PERSISTENCE",
            StoreError::DanglingReference { .. } => "ERR_STORE_DANGLING_REFERENCE",
            StoreError::Integrity { .. } => "ERR_STORE_INTEGRITY",
            StoreError::Serialization(_) => "ERR_STORE_SERIALIZATION",
            StoreError::Cancelled(_) => "ERR_STORE_CANCELLED",
            StoreError::Configuration(_) => "ERR_STORE_CONFIGURATION",
            StoreError::InvalidBundle(_) => "ERR_STORE_INVALID_BUNDLE",
            StoreError::Recovery(_) => "ERR_STORE_RECOVERY",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockgrid_storage::GridPosition;

    #[test]
    fn test_error_predicates() {
        let err = StoreError::Integrity {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(err.is_integrity_error());
        assert_eq!(err.error_code(), "ERR_STORE_INTEGRITY");

        let err = StoreError::DanglingReference {
            from: GridPosition::new(0, 0).cell_id(),
            to: GridPosition::new(1, 0).cell_id(),
        };
        assert!(err.is_dangling_reference());
        assert!(err.to_string().contains("0,0 -> 1,0"));

        let err: StoreError = StorageError::Unavailable("disk gone".to_string()).into();
        assert!(err.is_persistence_error());
    }
}
