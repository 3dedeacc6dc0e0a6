//! Passphrase-protected room key export files.
//!
//! Binary layout before armouring:
//!
//! ```text
//! ┌─────────┬──────────┬──────────┬────────────┬────────────┬──────────────┐
//! │ version │ salt     │ iv       │ rounds     │ ciphertext │ hmac-sha256  │
//! │ 1 byte  │ 16 bytes │ 16 bytes │ u32 BE     │ variable   │ 32 bytes     │
//! └─────────┴──────────┴──────────┴────────────┴────────────┴──────────────┘
//! ```
//!
//! The body is standard base64, wrapped at 96 columns between
//! `-----BEGIN MEGOLM SESSION DATA-----` and `-----END MEGOLM SESSION DATA-----`.

use aes::Aes256;
use base64::Engine;
use ctr::{
    Ctr128BE,
    cipher::{KeyIvInit, StreamCipher},
};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{encoding::STANDARD_PADDED, error::KeyExportError};

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// PBKDF2 iteration count used when the caller does not pick one.
pub const DEFAULT_EXPORT_ROUNDS: u32 = 500_000;

const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";
const VERSION: u8 = 1;
const LINE_LENGTH: usize = 96;
const SALT_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const HEADER_SIZE: usize = 1 + SALT_SIZE + IV_SIZE + 4;

#[derive(Zeroize, ZeroizeOnDrop)]
struct ExportKeys {
    aes: [u8; 32],
    hmac: [u8; 32],
}

impl ExportKeys {
    fn derive(passphrase: &str, salt: &[u8], rounds: u32) -> Self {
        let mut derived = [0u8; 64];
        pbkdf2::pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, rounds, &mut derived);

        let mut keys = Self { aes: [0u8; 32], hmac: [0u8; 32] };
        keys.aes.copy_from_slice(&derived[..32]);
        keys.hmac.copy_from_slice(&derived[32..]);
        derived.zeroize();
        keys
    }

    #[allow(clippy::expect_used)]
    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.hmac).expect("invariant: HMAC accepts keys of any length")
    }
}

/// Encrypt an export payload under a passphrase.
///
/// `salt` and `iv` must be fresh random bytes. Bit 7 of `iv[9]` is cleared
/// before use so the counter has room to grow, matching existing exporters.
///
/// # Errors
///
/// - `EmptyPassphrase` if `passphrase` is empty
pub fn encrypt_key_export(
    plaintext: &[u8],
    passphrase: &str,
    rounds: u32,
    salt: [u8; SALT_SIZE],
    mut iv: [u8; IV_SIZE],
) -> Result<String, KeyExportError> {
    if passphrase.is_empty() {
        return Err(KeyExportError::EmptyPassphrase);
    }
    iv[9] &= 0x7f;

    let keys = ExportKeys::derive(passphrase, &salt, rounds);

    let mut body = Vec::with_capacity(HEADER_SIZE + plaintext.len() + MAC_SIZE);
    body.push(VERSION);
    body.extend_from_slice(&salt);
    body.extend_from_slice(&iv);
    body.extend_from_slice(&rounds.to_be_bytes());

    let start = body.len();
    body.extend_from_slice(plaintext);
    Aes256Ctr::new(&keys.aes.into(), &iv.into()).apply_keystream(&mut body[start..]);

    let mut mac = keys.mac();
    mac.update(&body);
    body.extend_from_slice(&mac.finalize().into_bytes());

    Ok(armor(&STANDARD_PADDED.encode(&body)))
}

/// Decrypt an armoured export file.
///
/// # Errors
///
/// - `EmptyPassphrase` if `passphrase` is empty
/// - `InvalidArmor` / `InvalidBase64` / `Truncated` for malformed files
/// - `UnsupportedVersion` if the version byte is not 1
/// - `BadPassphrase` if the MAC does not verify
pub fn decrypt_key_export(armored: &str, passphrase: &str) -> Result<Vec<u8>, KeyExportError> {
    if passphrase.is_empty() {
        return Err(KeyExportError::EmptyPassphrase);
    }

    let encoded = unarmor(armored)?;
    let body = STANDARD_PADDED
        .decode(encoded)
        .map_err(|e| KeyExportError::InvalidBase64 { reason: e.to_string() })?;

    if body.len() < HEADER_SIZE + MAC_SIZE {
        return Err(KeyExportError::Truncated { len: body.len() });
    }
    if body[0] != VERSION {
        return Err(KeyExportError::UnsupportedVersion(body[0]));
    }

    let salt = &body[1..=SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&body[1 + SALT_SIZE..1 + SALT_SIZE + IV_SIZE]);
    let mut rounds = [0u8; 4];
    rounds.copy_from_slice(&body[HEADER_SIZE - 4..HEADER_SIZE]);
    let rounds = u32::from_be_bytes(rounds);

    let (authenticated, tag) = body.split_at(body.len() - MAC_SIZE);
    let keys = ExportKeys::derive(passphrase, salt, rounds);

    let mut mac = keys.mac();
    mac.update(authenticated);
    mac.verify_slice(tag).map_err(|_| KeyExportError::BadPassphrase)?;

    let mut plaintext = authenticated[HEADER_SIZE..].to_vec();
    Aes256Ctr::new(&keys.aes.into(), &iv.into()).apply_keystream(&mut plaintext);

    Ok(plaintext)
}

fn armor(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / LINE_LENGTH + 80);
    out.push_str(HEADER);
    out.push('\n');

    let mut rest = encoded;
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(LINE_LENGTH));
        out.push_str(line);
        out.push('\n');
        rest = tail;
    }

    out.push_str(FOOTER);
    out.push('\n');
    out
}

fn unarmor(armored: &str) -> Result<String, KeyExportError> {
    let mut lines = armored.lines().map(str::trim);

    lines.by_ref().find(|line| *line == HEADER).ok_or(KeyExportError::InvalidArmor { line: "header" })?;

    let mut encoded = String::new();
    for line in lines {
        if line == FOOTER {
            return Ok(encoded);
        }
        encoded.push_str(line);
    }

    Err(KeyExportError::InvalidArmor { line: "footer" })
}
