//! Fuzz target for to-device event decoding
//!
//! Every event the engine consumes arrives as JSON from the network. Decoding
//! must reject garbage with an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use olmstead_core::wire::{OlmPayload, ToDeviceContent};

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<ToDeviceContent>(data);
    let _ = serde_json::from_slice::<OlmPayload>(data);
});
