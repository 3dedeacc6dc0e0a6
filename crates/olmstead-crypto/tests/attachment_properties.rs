//! Property-based tests for attachment encryption
//!
//! These tests verify the invariants of the attachment cipher:
//!
//! 1. **Round-trip**: decrypt(encrypt(m)) == m for all payload sizes
//! 2. **Tamper sensitivity**: any single flipped bit yields `Integrity`
//! 3. **Determinism**: same key, IV and plaintext give the same ciphertext
//! 4. **Streaming equivalence**: tiny reads produce the same bytes as one read

use std::io::Read;

use olmstead_crypto::{
    AttachmentDecryptor, AttachmentEncryptor, AttachmentError, AttachmentKey, CHUNK_SIZE,
    decrypt_attachment, encrypt_attachment,
};
use proptest::prelude::*;

fn read_in_small_pieces(mut reader: impl Read, piece: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; piece];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn empty_attachment_roundtrip() {
    let (ciphertext, descriptor) = encrypt_attachment(&[], [1; 32], [2; 8]);
    assert!(ciphertext.is_empty());
    assert_eq!(decrypt_attachment(&ciphertext, &descriptor).unwrap(), Vec::<u8>::new());
}

#[test]
fn single_byte_attachment_roundtrip() {
    let (ciphertext, descriptor) = encrypt_attachment(&[0xAA], [1; 32], [2; 8]);
    assert_eq!(ciphertext.len(), 1);
    assert_eq!(decrypt_attachment(&ciphertext, &descriptor).unwrap(), vec![0xAA]);
}

#[test]
fn multi_chunk_attachment_roundtrip() {
    let plaintext: Vec<u8> = (0..CHUNK_SIZE * 3 + 1).map(|i| (i * 31) as u8).collect();
    let (ciphertext, descriptor) = encrypt_attachment(&plaintext, [9; 32], [8; 8]);
    assert_eq!(decrypt_attachment(&ciphertext, &descriptor).unwrap(), plaintext);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_roundtrip(
        plaintext in prop::collection::vec(any::<u8>(), 0..4096),
        key in any::<[u8; 32]>(),
        iv in any::<[u8; 8]>(),
    ) {
        let (ciphertext, descriptor) = encrypt_attachment(&plaintext, key, iv);
        prop_assert_eq!(decrypt_attachment(&ciphertext, &descriptor).unwrap(), plaintext);
    }

    #[test]
    fn prop_single_bit_flip_is_detected(
        plaintext in prop::collection::vec(any::<u8>(), 1..2048),
        key in any::<[u8; 32]>(),
        iv in any::<[u8; 8]>(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (mut ciphertext, descriptor) = encrypt_attachment(&plaintext, key, iv);
        let index = position.index(ciphertext.len());
        ciphertext[index] ^= 1 << bit;

        prop_assert_eq!(decrypt_attachment(&ciphertext, &descriptor), Err(AttachmentError::Integrity));
    }

    #[test]
    fn prop_deterministic(
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
        key in any::<[u8; 32]>(),
        iv in any::<[u8; 8]>(),
    ) {
        let first = encrypt_attachment(&plaintext, key, iv);
        let second = encrypt_attachment(&plaintext, key, iv);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_streaming_matches_bulk(
        plaintext in prop::collection::vec(any::<u8>(), 0..2048),
        piece in 1usize..97,
    ) {
        let key = [5u8; 32];
        let iv = [6u8; 8];
        let (bulk, bulk_descriptor) = encrypt_attachment(&plaintext, key, iv);

        let mut encryptor = AttachmentEncryptor::new(plaintext.as_slice(), AttachmentKey::new(key, iv));
        let streamed = read_in_small_pieces(&mut encryptor, piece).unwrap();
        let descriptor = encryptor.finish();

        prop_assert_eq!(&streamed, &bulk);
        prop_assert_eq!(&descriptor, &bulk_descriptor);

        let decryptor = AttachmentDecryptor::new(streamed.as_slice(), &descriptor).unwrap();
        prop_assert_eq!(read_in_small_pieces(decryptor, piece).unwrap(), plaintext);
    }
}
