//! Chaotic storage wrapper for fault injection testing
//!
//! Delegates to an underlying store but fails a deterministic fraction of
//! operations before they reach it. Failures never half-apply: a failed
//! write or update leaves the inner store untouched, which is exactly the
//! guarantee the engine relies on from real backends.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use super::{StorageError, Store, Table, Update, WriteOp};

/// Chaotic store that randomly injects `StorageError::Io` failures.
#[derive(Clone)]
pub struct ChaoticStore<S: Store> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    enabled: Arc<AtomicBool>,
    injected: Arc<AtomicUsize>,
}

/// Linear congruential generator, reproducible from its seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Store> ChaoticStore<S> {
    /// Wrap `inner`, failing roughly `failure_rate` of all operations.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
            enabled: Arc::new(AtomicBool::new(true)),
            injected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying store (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Turn fault injection on or off, e.g. to set up fixtures first.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, operation: &'static str) -> Result<(), StorageError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Io(format!("chaos: injected {operation} failure")));
        }
        Ok(())
    }
}

impl<S: Store> Store for ChaoticStore<S> {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.maybe_fail("get")?;
        self.inner.get(table, key)
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.maybe_fail("scan")?;
        self.inner.scan_prefix(table, prefix)
    }

    fn write(&self, batch: Vec<WriteOp>) -> Result<(), StorageError> {
        self.maybe_fail("write")?;
        self.inner.write(batch)
    }

    fn update(
        &self,
        table: Table,
        key: &[u8],
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<Update, StorageError>,
    ) -> Result<(), StorageError> {
        self.maybe_fail("update")?;
        self.inner.update(table, key, f)
    }

    fn clear(&self, table: Table) -> Result<(), StorageError> {
        self.maybe_fail("clear")?;
        self.inner.clear(table)
    }
}
