//! Decryption errors shared by the pairwise and group channels.

use thiserror::Error;

use crate::{ids::RoomId, storage::StorageError};

/// Why an incoming ciphertext could not be turned into plaintext.
///
/// Never retried. Missing-key variants are converted into key requests by
/// the caller; everything else is surfaced as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    /// No pairwise session with the sender decrypted the message
    #[error("no pairwise session with {sender_key} decrypts this message")]
    NoMatchingSession {
        /// Sender's Curve25519 identity key (base64)
        sender_key: String,
    },

    /// Message parsed but failed authentication or ratchet checks
    #[error("integrity failure: {reason}")]
    IntegrityFailure {
        /// What failed
        reason: String,
    },

    /// Message could not be parsed
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Parser message
        reason: String,
    },

    /// `(session, index)` was already decrypted once
    #[error("replayed message index {message_index} in session {session_id}")]
    Replay {
        /// Group session id
        session_id: String,
        /// Chain index seen twice
        message_index: u32,
    },

    /// No inbound group session for this room, sender and session id
    #[error("missing room key for session {session_id} in {room_id}")]
    MissingKey {
        /// Room the message belongs to
        room_id: RoomId,
        /// Group session id
        session_id: String,
    },

    /// Inbound session exists but starts after the requested index
    #[error("session {session_id} known from index {first_known}, message is at {requested}")]
    UnknownMessageIndex {
        /// Group session id
        session_id: String,
        /// Earliest index we can decrypt
        first_known: u32,
        /// Index of the message
        requested: u32,
    },

    /// Session state could not be loaded or saved
    #[error(transparent)]
    Store(#[from] StorageError),
}

impl DecryptionError {
    /// True when requesting the room key from other devices may help.
    pub fn is_missing_key(&self) -> bool {
        matches!(self, Self::MissingKey { .. } | Self::UnknownMessageIndex { .. })
    }
}
