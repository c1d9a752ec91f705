//! # error
//!
//! why: give the log manager and its storage backends one error vocabulary
//! relations: returned by storage.rs implementations and log.rs queries
//! what: StorageError (semantic conditions + medium faults), Error, Result

use thiserror::Error;

/// Errors reported by a durable store.
///
/// `Compacted` and `Unavailable` describe where an index sits relative to the
/// retained log; every other variant is a failure of the store itself.
#[derive(Debug, Error)]
pub enum StorageError {
    /// the index precedes the retained prefix and is only covered by a snapshot
    #[error("log entry at requested index has been compacted")]
    Compacted,

    /// the index has not been replicated here yet
    #[error("log entry at requested index is unavailable")]
    Unavailable,

    #[error("snapshot is older than the one already held")]
    SnapshotOutOfDate,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// true when the store itself failed, as opposed to reporting where an
    /// index sits relative to the retained log.
    pub fn is_storage_failure(&self) -> bool {
        !matches!(
            self,
            StorageError::Compacted | StorageError::Unavailable | StorageError::SnapshotOutOfDate
        )
    }
}

/// Top-level error for log manager operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StorageError),

    /// the store reported bounds or a hard state that cannot describe a valid log
    #[error("corrupted log state: {0}")]
    Corrupted(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),
}

impl Error {
    pub fn is_compacted(&self) -> bool {
        matches!(self, Error::Store(StorageError::Compacted))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Store(StorageError::Unavailable))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
