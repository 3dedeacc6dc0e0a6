//! Environment abstraction for deterministic testing.
//!
//! Decouples engine logic from system resources (wall clock, randomness,
//! sleeping). Production uses [`crate::SystemEnv`]; the simulation harness
//! supplies a virtual clock and a seeded RNG so retry schedules, rotation
//! deadlines and request ids are reproducible.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now_millis()` never goes backwards within one process
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect simulation setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Wall-clock time in milliseconds since the Unix epoch.
    ///
    /// Persisted in session records (last use, creation time), so it must be
    /// comparable across restarts.
    ///
    /// # Invariants
    ///
    /// - Subsequent calls return values >= previous calls.
    fn now_millis(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// Only used for retry backoff; engine logic never sleeps otherwise.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a fixed-size random array (keys, IVs, salts).
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }

    /// Random identifier suitable for request and device ids.
    ///
    /// Uppercase alphanumeric, `len` characters.
    fn random_id(&self, len: usize) -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

        let mut bytes = vec![0u8; len];
        self.random_bytes(&mut bytes);
        bytes.iter().map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char).collect()
    }
}
