//! Fuzz target for room key export files
//!
//! Feeds arbitrary armoured text to the export parser, and checks that a
//! genuine export only opens under its own passphrase.
//!
//! # Invariants
//!
//! - Parsing NEVER panics on arbitrary input
//! - A genuine export opens to exactly its plaintext
//! - Any other passphrase is rejected

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use olmstead_crypto::{decrypt_key_export, encrypt_key_export};

#[derive(Debug, Arbitrary)]
struct Scenario {
    armored: String,
    plaintext: Vec<u8>,
    passphrase: String,
    other_passphrase: String,
    salt: [u8; 16],
    iv: [u8; 16],
}

fuzz_target!(|scenario: Scenario| {
    let _ = decrypt_key_export(&scenario.armored, &scenario.passphrase);

    // Rounds kept minimal; stretching cost is irrelevant to parsing.
    let Ok(armored) = encrypt_key_export(&scenario.plaintext, &scenario.passphrase, 1, scenario.salt, scenario.iv)
    else {
        assert!(scenario.passphrase.is_empty());
        return;
    };

    assert_eq!(decrypt_key_export(&armored, &scenario.passphrase).ok(), Some(scenario.plaintext));
    if scenario.other_passphrase != scenario.passphrase {
        assert!(decrypt_key_export(&armored, &scenario.other_passphrase).is_err());
    }
});
