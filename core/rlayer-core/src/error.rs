//! Error types for the record layer.
//!
//! All public APIs return `RlResult<T>` — no panics in library code.

use thiserror::Error;

/// Unified error type for all record-layer operations.
#[derive(Debug, Error)]
pub enum RecordLayerError {
    /// The tuple codec hit truncated or otherwise invalid bytes.
    #[error("malformed tuple: {0}")]
    MalformedTuple(String),

    /// The tuple codec was asked to pack an element kind it does not know.
    #[error("unsupported tuple element: {0}")]
    UnsupportedElement(String),

    /// A record's bytes could not be deserialized, or failed a structural check.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A unique index already has an entry at the candidate prefix.
    #[error("uniqueness violation on index '{index}': conflicting key {conflicting_key:?}")]
    UniquenessViolation {
        index: String,
        conflicting_key: Vec<u8>,
    },

    /// `save` was called with an `expectedVersion` that did not match the stored version.
    #[error("version mismatch: expected {expected:?}, found {actual:?}")]
    VersionMismatch {
        expected: Vec<u8>,
        actual: Option<Vec<u8>>,
    },

    /// The transaction exceeded the KV's per-transaction byte budget.
    #[error("transaction too large: {size} bytes exceeds limit of {limit} bytes")]
    TransactionTooLarge { size: usize, limit: usize },

    /// The transaction's read version is too old to commit against current data.
    #[error(
        "transaction too old: read version {read_version} is before the oldest readable version {oldest_readable}"
    )]
    TransactionTooOld {
        read_version: u64,
        oldest_readable: u64,
    },

    /// Optimistic conflict detection aborted the transaction.
    #[error("conflict detected on key {0:?}")]
    ConflictDetected(Vec<u8>),

    /// No index with this name is defined in the schema.
    #[error("index '{0}' not found")]
    IndexNotFound(String),

    /// The index exists but is not in `readable` state, and the caller required it to be.
    #[error("index '{0}' is not readable")]
    IndexNotReadable(String),

    /// No record type with this name is defined in the schema.
    #[error("record type '{0}' not found")]
    RecordTypeNotFound(String),

    /// Schema evolution would break an invariant; the reason is included.
    #[error("schema evolution blocked: {0}")]
    SchemaEvolutionBlocked(String),

    /// A persisted `RangeSet` failed an internal consistency check on load.
    #[error("range set corruption: {0}")]
    RangeSetCorruption(String),

    /// An `OnlineIndexer`/`OnlineIndexScrubber` build is already running for this index.
    #[error("build already in progress for index '{0}'")]
    BuildInProgress(String),

    /// A migration step failed partway through.
    #[error("migration failed at step {step}: {reason}")]
    MigrationFailed { step: String, reason: String },

    /// Concurrent migrations were attempted on the same store.
    #[error("migration lock held by another runner")]
    MigrationLocked,

    /// Serialization/deserialization error (store header, statistics, etc).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying I/O error from the KV backend.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Result type alias for all record-layer operations.
pub type RlResult<T> = Result<T, RecordLayerError>;

impl From<serde_json::Error> for RecordLayerError {
    fn from(err: serde_json::Error) -> Self {
        RecordLayerError::Serialization(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for RecordLayerError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        RecordLayerError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_malformed_tuple() {
        let err = RecordLayerError::MalformedTuple("truncated at offset 4".to_string());
        assert_eq!(err.to_string(), "malformed tuple: truncated at offset 4");
    }

    #[test]
    fn error_display_uniqueness_violation() {
        let err = RecordLayerError::UniquenessViolation {
            index: "by_email".to_string(),
            conflicting_key: vec![1, 2, 3],
        };
        assert!(err.to_string().contains("by_email"));
    }

    #[test]
    fn error_display_version_mismatch() {
        let err = RecordLayerError::VersionMismatch {
            expected: vec![1],
            actual: Some(vec![2]),
        };
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn rl_result_ok() {
        let result: RlResult<i32> = Ok(42);
        assert_eq!(result.unwrap(), 42);
    }
}
