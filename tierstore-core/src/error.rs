//! Error types for tierstore operations

use thiserror::Error;

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    /// Stored fields that the current type does not declare. Tolerated by reads.
    #[error("Field mismatch loading {kind} with id {id}: {fields:?}")]
    FieldMismatch {
        kind: String,
        id: String,
        fields: Vec<String>,
    },

    /// A concurrent writer committed first. Retryable.
    #[error("Transaction conflict on {key}")]
    TransactionConflict { key: String },

    /// Conflict retries were exhausted or the transaction could not commit.
    #[error("Transaction failed after {attempts} attempt(s): {reason}")]
    TransactionFailed { attempts: u32, reason: String },

    #[error("Durable store error: {reason}")]
    Backend { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Cache tier errors. Never fatal to an operation that can still reach the
/// durable store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache tier unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cache tier error: {reason}")]
    Backend { reason: String },
}

/// Validation errors, including rejections raised by caller mutations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Mutation rejected: {reason}")]
    Rejected { reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Sequence {name} exhausted: {value} outside [{minimum}, {maximum}]")]
    SequenceExhausted {
        name: String,
        value: i64,
        minimum: i64,
        maximum: i64,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Serialization errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Encode failed for {kind}: {reason}")]
    Encode { kind: String, reason: String },

    #[error("Decode failed for {kind}: {reason}")]
    Decode { kind: String, reason: String },
}

/// Master error type for all tierstore errors.
#[derive(Debug, Clone, Error)]
pub enum TierError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The durable change committed but the cache entry for `key` could not
    /// be invalidated. The entry expires on its own TTL.
    #[error("Committed, but cache invalidation failed for {key}: {source}")]
    InvalidationFailed { key: String, source: CacheError },

    /// A time-boxed operation ran out of budget after making partial progress.
    #[error("Timed out after deleting {deleted} row(s)")]
    TimedOut { deleted: u64 },
}

/// Result type alias for tierstore operations.
pub type TierResult<T> = Result<T, TierError>;

/// The closed set of outcomes a caller needs to choose between retrying,
/// surfacing to a user, or aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NotFound,
    /// Business logic or input validation rejected the operation.
    Rejected,
    /// The durable store, the codec or configuration failed.
    Infrastructure,
    /// Partial progress was made; come back next cycle.
    TimedOut,
    /// The durable change is committed; only the cache may lag.
    StaleCache,
}

impl TierError {
    /// Classify this error into the caller-facing [`Outcome`] set.
    pub fn outcome(&self) -> Outcome {
        match self {
            TierError::Storage(StorageError::NotFound { .. }) => Outcome::NotFound,
            TierError::Validation(_) => Outcome::Rejected,
            TierError::TimedOut { .. } => Outcome::TimedOut,
            TierError::InvalidationFailed { .. } => Outcome::StaleCache,
            TierError::Storage(_)
            | TierError::Cache(_)
            | TierError::Config(_)
            | TierError::Codec(_) => Outcome::Infrastructure,
        }
    }

    /// Returns true for the distinguished not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TierError::Storage(StorageError::NotFound { .. }))
    }

    /// Returns true for a retryable transaction conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TierError::Storage(StorageError::TransactionConflict { .. })
        )
    }

    /// Shorthand for a caller mutation rejecting an entity.
    pub fn rejected(reason: impl Into<String>) -> Self {
        ValidationError::Rejected {
            reason: reason.into(),
        }
        .into()
    }

    /// View this error as a cache tier failure. Cache tiers report through
    /// [`TierResult`]; anything that is not already a [`CacheError`] is
    /// wrapped as a backend failure.
    pub fn into_cache_error(self) -> CacheError {
        match self {
            TierError::Cache(e) => e,
            other => CacheError::Backend {
                reason: other.to_string(),
            },
        }
    }

    /// Shorthand for a not-found error on `(kind, id)`.
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
        .into()
    }
}

// =============================================================================
// TESTS
// =============================================================================
