//! Error types for stateless cryptographic operations.

use thiserror::Error;

/// Errors that can occur while decrypting an attachment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachmentError {
    /// Recomputed ciphertext digest does not match the descriptor.
    ///
    /// Always fatal for this download. Any plaintext already produced must
    /// be discarded.
    #[error("attachment integrity check failed: ciphertext digest mismatch")]
    Integrity,

    /// Descriptor is malformed or names an unsupported algorithm
    #[error("invalid attachment descriptor: {reason}")]
    InvalidDescriptor {
        /// Which field failed validation
        reason: String,
    },

    /// Underlying reader failed
    #[error("attachment I/O error: {0}")]
    Io(String),
}

/// Errors that can occur while reading or writing a key export file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyExportError {
    /// Export passphrase was empty
    #[error("export passphrase must not be empty")]
    EmptyPassphrase,

    /// Header or footer line missing
    #[error("missing {line} line in key export")]
    InvalidArmor {
        /// The armour line that was not found
        line: &'static str,
    },

    /// Body is not valid base64
    #[error("key export body is not valid base64: {reason}")]
    InvalidBase64 {
        /// Decoder error message
        reason: String,
    },

    /// Body shorter than the fixed header plus MAC
    #[error("key export body truncated: {len} bytes")]
    Truncated {
        /// Length of the decoded body
        len: usize,
    },

    /// Format version not understood
    #[error("unsupported key export version {0}")]
    UnsupportedVersion(u8),

    /// MAC verification failed (wrong passphrase or tampered file)
    #[error("key export authentication failed: wrong passphrase or corrupted file")]
    BadPassphrase,
}
