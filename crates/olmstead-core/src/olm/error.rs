//! Pairwise channel errors.

use std::time::Duration;

use thiserror::Error;

use crate::{
    error::DecryptionError, identity::IdentityError, ids::DeviceKey, retry::Retryable,
    storage::StorageError, transport::TransportError,
};

/// Failure establishing an outbound pairwise session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Directory has neither a one-time nor a fallback key for the device
    #[error("no one-time key available for {device}")]
    NoOneTimeKey {
        /// Target device
        device: DeviceKey,
    },

    /// Claimed key is not signed by the device's signing key
    #[error("one-time key of {device} has an invalid signature")]
    InvalidOneTimeKeySignature {
        /// Target device
        device: DeviceKey,
    },

    /// Directory call failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Claim did not complete in time
    #[error("one-time key claim timed out after {after_ms}ms")]
    Timeout {
        /// Per-attempt timeout
        after_ms: u64,
    },

    /// Session could not be persisted
    #[error(transparent)]
    Store(#[from] StorageError),
}

impl Retryable for HandshakeError {
    fn is_transient(&self) -> bool {
        match self {
            Self::NoOneTimeKey { .. } | Self::Timeout { .. } => true,
            Self::Transport(err) => err.is_transient(),
            Self::InvalidOneTimeKeySignature { .. } | Self::Store(_) => false,
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout { after_ms: after.as_millis() as u64 }
    }
}

/// Any pairwise channel failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OlmError {
    /// Could not establish a session
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Incoming message rejected
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// Device lookup failed
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Session state could not be loaded or saved
    #[error(transparent)]
    Store(#[from] StorageError),
}

impl OlmError {
    /// True if the failure was the handshake, i.e. no channel is obtainable.
    pub fn is_no_olm(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_and_outages_are_retried() {
        let device = DeviceKey::new("@b:hs", "B");
        assert!(HandshakeError::NoOneTimeKey { device: device.clone() }.is_transient());
        assert!(HandshakeError::timed_out(Duration::from_secs(10)).is_transient());
        assert!(HandshakeError::Transport(TransportError::Unavailable { reason: "down".into() }).is_transient());
        assert!(!HandshakeError::InvalidOneTimeKeySignature { device }.is_transient());
        assert!(!HandshakeError::Transport(TransportError::Rejected { reason: "bad".into() }).is_transient());
    }
}
