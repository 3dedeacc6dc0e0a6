//! In-memory registry of key requests received from other devices.
//!
//! Requests awaiting a user decision are grouped per requesting device so a
//! device with several outstanding requests produces a single prompt. Within
//! a device there is at most one pending request per session: a re-request
//! under a new id replaces the old one.
//!
//! Finished and cancelled request ids are remembered, up to a fixed number
//! per set, so duplicates and reordered deliveries are no-ops.

#![allow(clippy::disallowed_types, reason = "Registry is only locked synchronously")]

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{Mutex, PoisonError},
};

use crate::{
    ids::DeviceKey,
    session_repository::{InboundGroupKey, RequestState},
};

/// Finished or tombstoned ids kept before the oldest is forgotten.
pub const REMEMBERED_REQUESTS: usize = 1024;

/// Identifies one incoming request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IncomingRequestKey {
    /// Device that asked
    pub requester: DeviceKey,
    /// Its request id
    pub request_id: String,
}

/// A request held until the user decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingKeyRequest {
    /// Device that asked
    pub requester: DeviceKey,
    /// Its request id
    pub request_id: String,
    /// Wanted session
    pub session: InboundGroupKey,
    /// Group algorithm
    pub algorithm: String,
    /// Pending until decided or cancelled
    pub state: RequestState,
}

impl IncomingKeyRequest {
    /// Registry key.
    pub fn key(&self) -> IncomingRequestKey {
        IncomingRequestKey { requester: self.requester.clone(), request_id: self.request_id.clone() }
    }
}

/// What inserting a held request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First pending request for this device; prompt the user
    FirstForDevice,
    /// Joined an existing prompt
    Coalesced,
    /// Replaced a pending request for the same session under a new id
    Superseded,
    /// Seen before, cancelled before arrival, or already decided
    Duplicate,
}

/// What a cancellation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// Removed a pending request; the device has nothing else pending
    LastForDevice,
    /// Removed a pending request; others remain
    Removed,
    /// Request not seen yet; remembered so a late arrival is ignored
    Tombstoned,
    /// Request already finished
    AlreadyFinished,
}

/// Insertion-ordered set that forgets its oldest entry past `capacity`.
struct RecentSet<T> {
    members: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone + Eq + std::hash::Hash> RecentSet<T> {
    fn new(capacity: usize) -> Self {
        Self { members: HashSet::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    fn insert(&mut self, value: T) {
        if !self.members.insert(value.clone()) {
            return;
        }
        self.order.push_back(value);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Inner {
    pending: BTreeMap<DeviceKey, BTreeMap<InboundGroupKey, IncomingKeyRequest>>,
    finished: RecentSet<IncomingRequestKey>,
    tombstones: RecentSet<IncomingRequestKey>,
}

impl Inner {
    fn new(capacity: usize) -> Self {
        Self { pending: BTreeMap::new(), finished: RecentSet::new(capacity), tombstones: RecentSet::new(capacity) }
    }

    fn is_pending(&self, key: &IncomingRequestKey) -> bool {
        self.pending
            .get(&key.requester)
            .is_some_and(|queue| queue.values().any(|request| request.request_id == key.request_id))
    }
}

/// Per-process registry, cleared on logout.
pub struct IncomingRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for IncomingRegistry {
    fn default() -> Self {
        Self::with_capacity(REMEMBERED_REQUESTS)
    }
}

impl IncomingRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry remembering at most `capacity` finished and
    /// `capacity` cancelled ids.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { inner: Mutex::new(Inner::new(capacity)), capacity }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// True if this request was already pending, finished or cancelled.
    pub fn is_known(&self, key: &IncomingRequestKey) -> bool {
        self.with(|inner| inner.finished.contains(key) || inner.tombstones.contains(key) || inner.is_pending(key))
    }

    /// Hold a request for a user decision.
    pub fn hold(&self, request: IncomingKeyRequest) -> Admission {
        let key = request.key();
        self.with(|inner| {
            if inner.finished.contains(&key) || inner.tombstones.contains(&key) {
                return Admission::Duplicate;
            }
            let queue = inner.pending.entry(key.requester.clone()).or_default();
            let first = queue.is_empty();
            let request = IncomingKeyRequest { state: RequestState::Pending, ..request };
            match queue.insert(request.session.clone(), request) {
                Some(previous) if previous.request_id == key.request_id => Admission::Duplicate,
                Some(previous) => {
                    inner.finished.insert(previous.key());
                    Admission::Superseded
                },
                None if first => Admission::FirstForDevice,
                None => Admission::Coalesced,
            }
        })
    }

    /// Remember a request answered without being held.
    pub fn finish(&self, key: IncomingRequestKey) {
        self.with(|inner| inner.finished.insert(key));
    }

    /// Withdraw a request.
    pub fn cancel(&self, key: &IncomingRequestKey) -> Cancellation {
        self.with(|inner| {
            if let Some(queue) = inner.pending.get_mut(&key.requester) {
                let before = queue.len();
                queue.retain(|_, request| request.request_id != key.request_id);
                if queue.len() < before {
                    let empty = queue.is_empty();
                    if empty {
                        inner.pending.remove(&key.requester);
                    }
                    inner.finished.insert(key.clone());
                    return if empty { Cancellation::LastForDevice } else { Cancellation::Removed };
                }
            }
            if inner.finished.contains(key) {
                return Cancellation::AlreadyFinished;
            }
            inner.tombstones.insert(key.clone());
            Cancellation::Tombstoned
        })
    }

    /// Remove and return every pending request of `device`.
    ///
    /// Taken requests are neither finished nor tombstoned: the caller
    /// finishes each one it answers and holds the rest again.
    pub fn take(&self, device: &DeviceKey) -> Vec<IncomingKeyRequest> {
        self.with(|inner| inner.pending.remove(device).map(|queue| queue.into_values().collect()).unwrap_or_default())
    }

    /// Pending requests of one device, ordered by session.
    pub fn pending_for(&self, device: &DeviceKey) -> Vec<IncomingKeyRequest> {
        self.with(|inner| inner.pending.get(device).map(|queue| queue.values().cloned().collect()).unwrap_or_default())
    }

    /// Devices with pending requests.
    pub fn devices_with_pending(&self) -> Vec<DeviceKey> {
        self.with(|inner| inner.pending.keys().cloned().collect())
    }

    /// Number of remembered finished and tombstoned ids.
    pub fn remembered(&self) -> usize {
        self.with(|inner| inner.finished.len() + inner.tombstones.len())
    }

    /// Forget everything (logout).
    pub fn clear(&self) {
        let capacity = self.capacity;
        self.with(|inner| *inner = Inner::new(capacity));
    }
}
