//! Per-key mutual exclusion.
//!
//! Pairwise operations are serialized per remote identity key and group
//! operations per room. The arbiter is injected into the engine so tests can
//! substitute an implementation that records acquisition order or forces
//! particular interleavings.

#![allow(clippy::disallowed_types, reason = "Registry map is only locked synchronously")]

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::OwnedMutexGuard;

use crate::ids::RoomId;

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Pairwise session state for one remote Curve25519 identity key (base64)
    Device(String),
    /// Outbound group session creation, rotation and sharing for a room
    OutboundRoom(RoomId),
    /// Inbound group session ratchets and replay markers for a room
    InboundRoom(RoomId),
}

/// Held lock. Releases on drop.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Boxed future returned by [`LockArbiter::acquire`].
pub type AcquireFuture<'a> = Pin<Box<dyn Future<Output = LockGuard> + Send + 'a>>;

/// Grants exclusive access per [`LockKey`].
///
/// # Invariants
///
/// - At most one guard per key is alive at any time
/// - Guards for different keys never block each other
pub trait LockArbiter: Send + Sync + 'static {
    /// Wait until `key` is free and take it.
    fn acquire(&self, key: LockKey) -> AcquireFuture<'_>;
}

/// Default arbiter: one `tokio::sync::Mutex` per key, created on demand.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Idle slots are pruned once the registry grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

impl KeyedLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.len() > PRUNE_THRESHOLD {
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        Arc::clone(slots.entry(key).or_default())
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl LockArbiter for KeyedLocks {
    fn acquire(&self, key: LockKey) -> AcquireFuture<'_> {
        let slot = self.slot(key);
        Box::pin(async move { LockGuard { _guard: slot.lock_owned().await } })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::{AtomicUsize, Ordering}, time::Duration};

    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(LockKey::Device("k".into())).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _room = locks.acquire(LockKey::OutboundRoom(RoomId::new("!a:hs"))).await;
        let acquired = tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire(LockKey::InboundRoom(RoomId::new("!a:hs"))),
        )
        .await;
        assert!(acquired.is_ok());
        assert_eq!(locks.tracked(), 2);
    }
}
