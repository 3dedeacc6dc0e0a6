//! Fuzz target for attachment decryption
//!
//! Encrypts an arbitrary plaintext, then applies an arbitrary mutation to
//! either the ciphertext or the descriptor before decrypting.
//!
//! # Invariants
//!
//! - Decryption NEVER panics, whatever the descriptor contains
//! - An unmodified attachment always decrypts to its plaintext
//! - A flipped ciphertext bit is always reported as an integrity failure
//! - The streaming decryptor agrees with the one-shot function

#![no_main]

use std::io::Read;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use olmstead_crypto::{
    AttachmentDecryptor, AttachmentError, attachment_error_from_io, decrypt_attachment, encrypt_attachment,
};

#[derive(Debug, Arbitrary)]
struct Scenario {
    key: [u8; 32],
    iv_random: [u8; 8],
    plaintext: Vec<u8>,
    mutation: Mutation,
}

#[derive(Debug, Arbitrary)]
enum Mutation {
    None,
    FlipBit { offset: usize, bit: u8 },
    Truncate { len: usize },
    ReplaceIv(String),
    ReplaceKey(String),
    ReplaceHash(String),
    ReplaceVersion(String),
}

fuzz_target!(|scenario: Scenario| {
    let (mut ciphertext, mut descriptor) =
        encrypt_attachment(&scenario.plaintext, scenario.key, scenario.iv_random);

    let mut tampered_body = false;
    match scenario.mutation {
        Mutation::None => {},
        Mutation::FlipBit { offset, bit } => {
            if !ciphertext.is_empty() {
                let offset = offset % ciphertext.len();
                ciphertext[offset] ^= 1 << (bit % 8);
                tampered_body = true;
            }
        },
        Mutation::Truncate { len } => {
            if !ciphertext.is_empty() {
                ciphertext.truncate(len % ciphertext.len());
                tampered_body = true;
            }
        },
        Mutation::ReplaceIv(iv) => descriptor.iv = iv,
        Mutation::ReplaceKey(k) => descriptor.key.k = k,
        Mutation::ReplaceHash(hash) => {
            descriptor.hashes.insert("sha256".to_owned(), hash);
        },
        Mutation::ReplaceVersion(v) => descriptor.v = v,
    }

    let one_shot = decrypt_attachment(&ciphertext, &descriptor);

    let streamed = AttachmentDecryptor::new(ciphertext.as_slice(), &descriptor).and_then(|mut decryptor| {
        let mut out = Vec::new();
        decryptor.read_to_end(&mut out).map_err(|e| attachment_error_from_io(&e))?;
        Ok(out)
    });
    assert_eq!(one_shot, streamed);

    if tampered_body {
        assert_eq!(one_shot, Err(AttachmentError::Integrity));
    }
    if let Ok(plaintext) = one_shot {
        assert_eq!(plaintext, scenario.plaintext);
    }
});
