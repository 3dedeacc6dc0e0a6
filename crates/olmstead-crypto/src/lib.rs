//! Olmstead Cryptographic Primitives
//!
//! Stateless building blocks that sit beside the session engine: streaming
//! attachment encryption and the passphrase-protected room key export format.
//! Pure functions with deterministic outputs. Callers provide random bytes
//! (key material, IVs, salts) so tests can pin every input.
//!
//! # Attachments
//!
//! ```text
//! plaintext stream
//!        │
//!        ▼
//! AES-256-CTR (random key, IV = 8 random bytes ‖ 8 zero bytes)
//!        │
//!        ├──► ciphertext stream
//!        ▼
//! running SHA-256 of ciphertext → descriptor.hashes.sha256
//! ```
//!
//! Decryption recomputes the digest while streaming and compares it against
//! the descriptor in constant time once the input is exhausted. A mismatch is
//! reported as [`AttachmentError::Integrity`]; the caller must discard every
//! byte it has already read.
//!
//! # Key Export
//!
//! Room keys leave the device only inside the armoured
//! `MEGOLM SESSION DATA` format: PBKDF2-HMAC-SHA512 stretches the passphrase
//! into an AES-256-CTR key and an HMAC-SHA256 key, and the MAC covers every
//! byte that precedes it.
//!
//! # Security
//!
//! - Attachment keys and derived export keys are zeroized on drop
//! - Digest and MAC comparisons are constant time
//! - The counter half of the attachment IV starts at zero, so it cannot wrap
//!   for any attachment shorter than 2^64 blocks

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod attachment;
pub mod encoding;
mod error;
pub mod key_export;

pub use attachment::{
    AttachmentDecryptor, AttachmentEncryptor, AttachmentKey, CHUNK_SIZE,
    EncryptedAttachmentDescriptor, IV_RANDOM_SIZE, JsonWebKey, attachment_error_from_io,
    decrypt_attachment, encrypt_attachment,
};
pub use error::{AttachmentError, KeyExportError};
pub use key_export::{DEFAULT_EXPORT_ROUNDS, decrypt_key_export, encrypt_key_export};
