//! Storage error types.

use thiserror::Error;

/// Errors surfaced by [`super::Store`] implementations.
///
/// Fatal to the current operation, never to the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend I/O failure (disk, transaction, injected fault)
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Record could not be encoded or decoded
    #[error("storage serialization error: {0}")]
    Serialization(String),

    /// Stored blob is present but unusable (bad pickle, wrong key)
    #[error("corrupted record: {0}")]
    Corrupted(String),

    /// Record that must exist was missing
    #[error("record not found")]
    NotFound,
}

impl StorageError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
