//! Group channel errors.

use olmstead_crypto::KeyExportError;
use thiserror::Error;

use crate::{error::DecryptionError, olm::OlmError, storage::StorageError};

/// Failures of outbound group operations, sharing and key import/export.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// Pairwise channel failed for a reason other than "no session obtainable"
    #[error(transparent)]
    Olm(#[from] OlmError),

    /// Incoming room key or message rejected
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// Session state could not be loaded or saved
    #[error(transparent)]
    Store(#[from] StorageError),

    /// Key export file could not be produced or opened
    #[error(transparent)]
    KeyExport(#[from] KeyExportError),

    /// Room key content is unusable
    #[error("invalid room key: {reason}")]
    InvalidRoomKey {
        /// What was wrong
        reason: String,
    },
}
