//! Simulated environment: virtual clock and seeded RNG.
//!
//! Sleeping advances the clock instantly, so retry backoff and rotation
//! deadlines are exercised without waiting. Clones share the clock and RNG.

#![allow(clippy::disallowed_types, reason = "RNG lock is only held synchronously")]

use std::{
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use olmstead_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Arbitrary fixed epoch so timestamps look like real wall-clock values.
const START_MILLIS: u64 = 1_700_000_000_000;

/// Deterministic [`Environment`].
#[derive(Clone)]
pub struct SimEnv {
    now: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with a specific RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(START_MILLIS)),
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_bytes() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(a.random_array::<32>(), b.random_array::<32>());
        assert_ne!(a.random_array::<32>(), SimEnv::with_seed(43).random_array::<32>());
    }

    #[tokio::test]
    async fn sleep_advances_virtual_clock() {
        let env = SimEnv::new();
        let before = env.now_millis();
        env.sleep(Duration::from_secs(3)).await;
        assert_eq!(env.now_millis(), before + 3_000);
    }

    #[test]
    fn clones_share_clock() {
        let env = SimEnv::new();
        let clone = env.clone();
        env.advance(Duration::from_millis(5));
        assert_eq!(clone.now_millis(), env.now_millis());
    }
}
