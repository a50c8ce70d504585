//! Error types for the bucket store.
use thiserror::Error;

/// The primary error type for operations within this library.
#[derive(Error, Debug)]
pub enum BucketError {
    /// A record or query failed a semantic rule. The message names the offending field or key.
    #[error("{0}")]
    Validation(String),

    /// Input had the wrong shape (column arity, undecodable characters, ...).
    #[error("{0}")]
    Parse(String),

    /// The requested sort key or direction is not usable for the result set.
    #[error("Invalid sort: {0}")]
    InvalidSort(String),

    /// Grouping was requested with an unusable combination of keys.
    #[error("{0}")]
    Grouping(String),

    /// The storage backend lost its connection. Saves are retried on this error.
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    /// The storage backend failed permanently.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wraps an underlying error from the Banyan crate or the block store.
    #[error("Underlying Banyan/Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl BucketError {
    /// Errors caused by the request itself. These map to a 400 at the request boundary and are
    /// never retried.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            BucketError::Validation(_)
                | BucketError::Parse(_)
                | BucketError::InvalidSort(_)
                | BucketError::Grouping(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BucketError::TransientStorage(_))
    }
}

/// A convenience type alias for `Result<T, BucketError>`.
pub type Result<T, E = BucketError> = std::result::Result<T, E>;
