//! Base64 flavours used on the wire.
//!
//! Key material inside JSON Web Keys is URL-safe base64 without padding, while
//! IVs, digests and ratchet payloads use the standard alphabet without
//! padding. Decoding is lenient about padding because peers disagree on it.

use base64::{
    Engine, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};

const UNPADDED: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_encode_padding(false)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, UNPADDED);

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, UNPADDED);

/// Padded standard base64, as used inside armoured export files.
pub(crate) const STANDARD_PADDED: GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Encode with the standard alphabet, no padding.
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD_LENIENT.encode(bytes)
}

/// Decode standard base64, padded or not.
pub fn decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_LENIENT.decode(input)
}

/// Encode with the URL-safe alphabet, no padding.
pub fn encode_url_safe(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_LENIENT.encode(bytes)
}

/// Decode URL-safe base64, padded or not.
pub fn decode_url_safe(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_LENIENT.decode(input)
}

/// Rewrite URL-safe base64 text into the standard alphabet.
///
/// Pure character mapping: `-` becomes `+`, `_` becomes `/`. Length, order
/// and padding are preserved, so the transform never fails.
pub fn url_safe_to_standard(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect()
}

/// Rewrite standard base64 text into the URL-safe alphabet.
///
/// Inverse of [`url_safe_to_standard`].
pub fn standard_to_url_safe(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect()
}
