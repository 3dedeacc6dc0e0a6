//! Streaming attachment encryption (AES-256-CTR + SHA-256).
//!
//! Both directions are [`Read`] adapters so arbitrarily large media can be
//! piped through without buffering the whole file. Each `read` call processes
//! at most [`CHUNK_SIZE`] bytes.
//!
//! All functions are pure - key material and IV randomness are provided by
//! the caller.

use std::{
    collections::BTreeMap,
    io::{self, Read},
};

use aes::Aes256;
use ctr::{
    Ctr128BE,
    cipher::{KeyIvInit, StreamCipher},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{encoding, error::AttachmentError};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Maximum number of bytes transformed per `read` call.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Number of random high-order IV bytes. The low-order half is the counter.
pub const IV_RANDOM_SIZE: usize = 8;

const ALGORITHM: &str = "A256CTR";
const KEY_TYPE: &str = "oct";
const VERSION: &str = "v2";
const SHA256: &str = "sha256";

/// Symmetric key and IV for a single attachment.
///
/// Never reused across attachments. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AttachmentKey {
    key: [u8; 32],
    iv: [u8; 16],
}

impl AttachmentKey {
    /// Build a key from 32 random key bytes and 8 random IV bytes.
    ///
    /// The IV is `iv_random ‖ 0x00 * 8`; the big-endian counter occupies the
    /// zeroed low-order half.
    pub fn new(key: [u8; 32], iv_random: [u8; IV_RANDOM_SIZE]) -> Self {
        let mut iv = [0u8; 16];
        iv[..IV_RANDOM_SIZE].copy_from_slice(&iv_random);
        Self { key, iv }
    }

    fn cipher(&self) -> Aes256Ctr {
        Aes256Ctr::new(&self.key.into(), &self.iv.into())
    }
}

impl std::fmt::Debug for AttachmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentKey").finish_non_exhaustive()
    }
}

/// JSON Web Key carrying the attachment key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    /// Key algorithm, always `A256CTR`
    pub alg: String,
    /// Extractable flag, always `true`
    pub ext: bool,
    /// Permitted operations, `["encrypt", "decrypt"]`
    pub key_ops: Vec<String>,
    /// Key type, always `oct`
    pub kty: String,
    /// URL-safe base64 key bytes, no padding
    pub k: String,
}

/// Everything a recipient needs to decrypt and verify one attachment.
///
/// Immutable once produced. Travels alongside the upload URL in the room
/// event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedAttachmentDescriptor {
    /// Cipher name, always `A256CTR`
    pub algorithm: String,
    /// The symmetric key
    pub key: JsonWebKey,
    /// Standard base64 IV, no padding
    pub iv: String,
    /// Digests of the ciphertext keyed by algorithm (`sha256`)
    pub hashes: BTreeMap<String, String>,
    /// Descriptor version, `v2`
    pub v: String,
}

impl EncryptedAttachmentDescriptor {
    fn new(key: &AttachmentKey, digest: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert(SHA256.to_owned(), encoding::encode(digest));

        Self {
            algorithm: ALGORITHM.to_owned(),
            key: JsonWebKey {
                alg: ALGORITHM.to_owned(),
                ext: true,
                key_ops: vec!["encrypt".to_owned(), "decrypt".to_owned()],
                kty: KEY_TYPE.to_owned(),
                k: encoding::encode_url_safe(key.key),
            },
            iv: encoding::encode(key.iv),
            hashes,
            v: VERSION.to_owned(),
        }
    }

    /// Parse and validate the key, IV and expected digest.
    fn parse(&self) -> Result<(AttachmentKey, [u8; 32]), AttachmentError> {
        let invalid = |reason: &str| AttachmentError::InvalidDescriptor { reason: reason.to_owned() };

        if self.algorithm != ALGORITHM || self.key.alg != ALGORITHM {
            return Err(invalid("unsupported algorithm"));
        }
        if self.key.kty != KEY_TYPE {
            return Err(invalid("unsupported key type"));
        }
        if !self.key.key_ops.iter().any(|op| op == "decrypt") {
            return Err(invalid("key does not permit decrypt"));
        }
        if self.v != VERSION {
            return Err(invalid("unsupported version"));
        }

        let mut key = [0u8; 32];
        let mut raw_key = encoding::decode_url_safe(&self.key.k)
            .map_err(|_| invalid("key is not url-safe base64"))?;
        if raw_key.len() != key.len() {
            raw_key.zeroize();
            return Err(invalid("key must be 32 bytes"));
        }
        key.copy_from_slice(&raw_key);
        raw_key.zeroize();

        let raw_iv = encoding::decode(&self.iv).map_err(|_| invalid("iv is not base64"))?;
        let iv: [u8; 16] = raw_iv.try_into().map_err(|_| invalid("iv must be 16 bytes"))?;

        let digest = self.hashes.get(SHA256).ok_or_else(|| invalid("missing sha256 hash"))?;
        let raw_digest = encoding::decode(digest).map_err(|_| invalid("sha256 is not base64"))?;
        let digest: [u8; 32] =
            raw_digest.try_into().map_err(|_| invalid("sha256 must be 32 bytes"))?;

        Ok((AttachmentKey { key, iv }, digest))
    }
}

/// Encrypting reader. Yields ciphertext for the plaintext read from `inner`.
///
/// Call [`AttachmentEncryptor::finish`] after the stream is exhausted to get
/// the descriptor carrying the ciphertext digest.
pub struct AttachmentEncryptor<R: Read> {
    inner: R,
    key: AttachmentKey,
    cipher: Aes256Ctr,
    hasher: Sha256,
}

impl<R: Read> AttachmentEncryptor<R> {
    /// Wrap a plaintext reader.
    pub fn new(inner: R, key: AttachmentKey) -> Self {
        let cipher = key.cipher();
        Self { inner, key, cipher, hasher: Sha256::new() }
    }

    /// Finalize the digest and produce the descriptor.
    ///
    /// Only meaningful once the reader has returned `Ok(0)`; finishing early
    /// produces a digest of the ciphertext emitted so far.
    pub fn finish(self) -> EncryptedAttachmentDescriptor {
        let digest = self.hasher.finalize();
        EncryptedAttachmentDescriptor::new(&self.key, &digest)
    }
}

impl<R: Read> Read for AttachmentEncryptor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(CHUNK_SIZE);
        let n = self.inner.read(&mut buf[..len])?;

        self.cipher.apply_keystream(&mut buf[..n]);
        self.hasher.update(&buf[..n]);

        Ok(n)
    }
}

/// Decrypting reader. Yields plaintext and verifies the digest at EOF.
///
/// The final `read` returning `Ok(0)` is only produced when the digest
/// matched. On mismatch the final read fails with an `InvalidData` error
/// wrapping [`AttachmentError::Integrity`], and every later read repeats it.
pub struct AttachmentDecryptor<R: Read> {
    inner: R,
    cipher: Aes256Ctr,
    hasher: Option<Sha256>,
    expected: [u8; 32],
    verified: Option<bool>,
}

impl<R: Read> AttachmentDecryptor<R> {
    /// Wrap a ciphertext reader.
    ///
    /// # Errors
    ///
    /// - `InvalidDescriptor` if the descriptor is malformed or unsupported
    pub fn new(inner: R, descriptor: &EncryptedAttachmentDescriptor) -> Result<Self, AttachmentError> {
        let (key, expected) = descriptor.parse()?;
        Ok(Self { inner, cipher: key.cipher(), hasher: Some(Sha256::new()), expected, verified: None })
    }

    fn integrity_error() -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, AttachmentError::Integrity)
    }
}

impl<R: Read> Read for AttachmentDecryptor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.verified {
            Some(true) => return Ok(0),
            Some(false) => return Err(Self::integrity_error()),
            None => {},
        }

        let len = buf.len().min(CHUNK_SIZE);
        let n = self.inner.read(&mut buf[..len])?;

        if n == 0 && len > 0 {
            let matches =
                self.hasher.take().is_some_and(|hasher| hasher.finalize().as_slice().ct_eq(&self.expected).into());
            self.verified = Some(matches);

            return if matches { Ok(0) } else { Err(Self::integrity_error()) };
        }

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        self.cipher.apply_keystream(&mut buf[..n]);

        Ok(n)
    }
}

/// Encrypt an in-memory attachment.
///
/// Returns the ciphertext and its descriptor.
#[allow(clippy::expect_used)]
pub fn encrypt_attachment(
    plaintext: &[u8],
    key: [u8; 32],
    iv_random: [u8; IV_RANDOM_SIZE],
) -> (Vec<u8>, EncryptedAttachmentDescriptor) {
    let mut encryptor = AttachmentEncryptor::new(plaintext, AttachmentKey::new(key, iv_random));
    let mut ciphertext = Vec::with_capacity(plaintext.len());

    encryptor
        .read_to_end(&mut ciphertext)
        .expect("invariant: reading from an in-memory slice is infallible");

    (ciphertext, encryptor.finish())
}

/// Decrypt and verify an in-memory attachment.
///
/// # Errors
///
/// - `InvalidDescriptor` if the descriptor cannot be parsed
/// - `Integrity` if the ciphertext digest does not match; no plaintext is
///   returned in that case
pub fn decrypt_attachment(
    ciphertext: &[u8],
    descriptor: &EncryptedAttachmentDescriptor,
) -> Result<Vec<u8>, AttachmentError> {
    let mut decryptor = AttachmentDecryptor::new(ciphertext, descriptor)?;
    let mut plaintext = Vec::with_capacity(ciphertext.len());

    match decryptor.read_to_end(&mut plaintext) {
        Ok(_) => Ok(plaintext),
        Err(err) => {
            plaintext.zeroize();
            Err(attachment_error_from_io(&err))
        },
    }
}

/// Recover the typed error carried by a decryptor I/O error.
pub fn attachment_error_from_io(err: &io::Error) -> AttachmentError {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<AttachmentError>())
        .cloned()
        .unwrap_or_else(|| AttachmentError::Io(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];
    const IV: [u8; IV_RANDOM_SIZE] = [0x17; IV_RANDOM_SIZE];

    #[test]
    fn iv_low_half_is_zero() {
        let key = AttachmentKey::new(KEY, IV);
        assert_eq!(&key.iv[..8], &IV);
        assert_eq!(&key.iv[8..], &[0u8; 8]);
    }

    #[test]
    fn descriptor_has_expected_shape() {
        let (_, descriptor) = encrypt_attachment(b"hello", KEY, IV);

        assert_eq!(descriptor.algorithm, "A256CTR");
        assert_eq!(descriptor.v, "v2");
        assert_eq!(descriptor.key.kty, "oct");
        assert_eq!(descriptor.key.key_ops, vec!["encrypt", "decrypt"]);
        assert!(descriptor.key.ext);
        assert!(!descriptor.key.k.contains('='));
        assert!(!descriptor.key.k.contains('+'));
        assert!(descriptor.hashes.contains_key("sha256"));

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["key"]["alg"], "A256CTR");
        assert_eq!(json["hashes"]["sha256"], descriptor.hashes["sha256"]);
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let plaintext = vec![0u8; 64];
        let (ciphertext, _) = encrypt_attachment(&plaintext, KEY, IV);
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(ciphertext, plaintext);
    }

    #[test]
    fn roundtrip_across_chunk_boundary() {
        let plaintext: Vec<u8> = (0..CHUNK_SIZE * 2 + 7).map(|i| i as u8).collect();
        let (ciphertext, descriptor) = encrypt_attachment(&plaintext, KEY, IV);
        assert_eq!(decrypt_attachment(&ciphertext, &descriptor).unwrap(), plaintext);
    }

    #[test]
    fn truncated_ciphertext_fails_integrity() {
        let (ciphertext, descriptor) = encrypt_attachment(b"some attachment", KEY, IV);
        let result = decrypt_attachment(&ciphertext[..ciphertext.len() - 1], &descriptor);
        assert_eq!(result, Err(AttachmentError::Integrity));
    }

    #[test]
    fn decryptor_repeats_integrity_error() {
        let (mut ciphertext, descriptor) = encrypt_attachment(b"payload", KEY, IV);
        ciphertext[0] ^= 1;

        let mut decryptor = AttachmentDecryptor::new(ciphertext.as_slice(), &descriptor).unwrap();
        let mut sink = Vec::new();
        assert!(decryptor.read_to_end(&mut sink).is_err());

        let mut buf = [0u8; 4];
        let err = decryptor.read(&mut buf).unwrap_err();
        assert_eq!(attachment_error_from_io(&err), AttachmentError::Integrity);
    }

    #[test]
    fn wrong_algorithm_rejected() {
        let (ciphertext, mut descriptor) = encrypt_attachment(b"x", KEY, IV);
        descriptor.algorithm = "A128CTR".to_owned();
        assert!(matches!(
            decrypt_attachment(&ciphertext, &descriptor),
            Err(AttachmentError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn short_key_rejected() {
        let (ciphertext, mut descriptor) = encrypt_attachment(b"x", KEY, IV);
        descriptor.key.k = encoding::encode_url_safe([1u8; 16]);
        assert!(matches!(
            decrypt_attachment(&ciphertext, &descriptor),
            Err(AttachmentError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn missing_digest_rejected() {
        let (ciphertext, mut descriptor) = encrypt_attachment(b"x", KEY, IV);
        descriptor.hashes.clear();
        assert!(matches!(
            decrypt_attachment(&ciphertext, &descriptor),
            Err(AttachmentError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn padded_descriptor_fields_accepted() {
        let (ciphertext, mut descriptor) = encrypt_attachment(b"padding", KEY, IV);
        descriptor.iv.push_str("==");
        assert_eq!(decrypt_attachment(&ciphertext, &descriptor).unwrap(), b"padding");
    }
}
