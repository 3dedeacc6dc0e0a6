//! In-memory key directory with fault injection.
//!
//! One instance is shared by every simulated device. Claims consume one-time
//! keys in key-id order and fall back to the device's fallback key once the
//! pool is empty, like the real directory.

#![allow(clippy::disallowed_types, reason = "Directory state is only locked synchronously")]

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use olmstead_core::{
    ClaimedOneTimeKey, DeviceId, DeviceKey, KeyDirectory, OneTimeKeyUpload, SignedDeviceKeys, TransportError, UserId,
    dehydration::{DehydratedDevice, DehydratedDeviceRequest},
};
use tracing::trace;

/// Directory endpoints, for targeted failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirectoryOp {
    /// One-time key claim
    Claim,
    /// Device key upload
    UploadDeviceKeys,
    /// One-time key upload
    UploadOneTimeKeys,
    /// Dehydrated device upload
    SetDehydratedDevice,
}

#[derive(Default)]
struct DirectoryState {
    device_keys: BTreeMap<DeviceKey, SignedDeviceKeys>,
    one_time_keys: BTreeMap<DeviceKey, BTreeMap<String, ClaimedOneTimeKey>>,
    fallback_keys: BTreeMap<DeviceKey, ClaimedOneTimeKey>,
    dehydrated: BTreeMap<DeviceId, DehydratedDeviceRequest>,
    offline: bool,
    transient_failures: u32,
    rejected: BTreeSet<DirectoryOp>,
    claims: u64,
}

impl DirectoryState {
    fn check(&mut self, op: DirectoryOp) -> Result<(), TransportError> {
        if self.offline {
            return Err(TransportError::Unavailable { reason: "directory offline".into() });
        }
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(TransportError::Unavailable { reason: "injected transient failure".into() });
        }
        if self.rejected.contains(&op) {
            return Err(TransportError::Rejected { reason: format!("{op:?} rejected") });
        }
        Ok(())
    }
}

/// Shared in-memory [`KeyDirectory`].
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Published device keys of one device.
    pub fn device_keys(&self, device: &DeviceKey) -> Option<SignedDeviceKeys> {
        self.lock().device_keys.get(device).cloned()
    }

    /// Published device keys of every device of a user.
    pub fn user_device_keys(&self, user: &UserId) -> Vec<SignedDeviceKeys> {
        self.lock().device_keys.iter().filter(|(key, _)| &key.user_id == user).map(|(_, keys)| keys.clone()).collect()
    }

    /// Unclaimed one-time keys of a device.
    pub fn one_time_key_count(&self, device: &DeviceKey) -> usize {
        self.lock().one_time_keys.get(device).map_or(0, BTreeMap::len)
    }

    /// Whether the device published a fallback key.
    pub fn has_fallback_key(&self, device: &DeviceKey) -> bool {
        self.lock().fallback_keys.contains_key(device)
    }

    /// Drop every unclaimed one-time key of a device, leaving only its
    /// fallback key.
    pub fn exhaust_one_time_keys(&self, device: &DeviceKey) {
        self.lock().one_time_keys.remove(device);
    }

    /// Claims served so far.
    pub fn claim_count(&self) -> u64 {
        self.lock().claims
    }

    /// Fail every call while offline.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    /// Permanently reject one endpoint.
    pub fn reject(&self, op: DirectoryOp) {
        self.lock().rejected.insert(op);
    }

    /// Stop rejecting an endpoint.
    pub fn accept(&self, op: DirectoryOp) {
        self.lock().rejected.remove(&op);
    }

    /// Stored dehydrated device, as a new login downloads it.
    pub fn dehydrated_device(&self, device_id: &DeviceId) -> Option<DehydratedDevice> {
        self.lock().dehydrated.get(device_id).cloned().map(DehydratedDevice::from)
    }

    /// Ids of every stored dehydrated device.
    pub fn dehydrated_device_ids(&self) -> Vec<DeviceId> {
        self.lock().dehydrated.keys().cloned().collect()
    }
}

impl MemoryDirectory {
    fn claim(&self, device: &DeviceKey) -> Result<Option<ClaimedOneTimeKey>, TransportError> {
        let mut state = self.lock();
        state.check(DirectoryOp::Claim)?;
        state.claims += 1;

        let claimed = state.one_time_keys.get_mut(device).and_then(BTreeMap::pop_first).map(|(_, key)| key);
        let claimed = claimed.or_else(|| state.fallback_keys.get(device).cloned());
        trace!(device = %device, found = claimed.is_some(), "claimed one-time key");
        Ok(claimed)
    }

    fn store_device_keys(&self, keys: &SignedDeviceKeys) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.check(DirectoryOp::UploadDeviceKeys)?;
        state.device_keys.insert(DeviceKey::new(keys.user_id.clone(), keys.device_id.clone()), keys.clone());
        Ok(())
    }

    fn store_one_time_keys(&self, upload: &OneTimeKeyUpload) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.check(DirectoryOp::UploadOneTimeKeys)?;

        let pool = state.one_time_keys.entry(upload.device.clone()).or_default();
        for (key_id, key) in &upload.one_time_keys {
            pool.entry(key_id.clone()).or_insert_with(|| ClaimedOneTimeKey { key_id: key_id.clone(), key: key.clone() });
        }
        if let Some((key_id, key)) = upload.fallback_keys.iter().next_back() {
            state.fallback_keys.insert(upload.device.clone(), ClaimedOneTimeKey { key_id: key_id.clone(), key: key.clone() });
        }
        Ok(())
    }

    fn store_dehydrated(&self, request: &DehydratedDeviceRequest) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.check(DirectoryOp::SetDehydratedDevice)?;
        state.dehydrated.insert(request.device_id.clone(), request.clone());
        Ok(())
    }
}

impl KeyDirectory for MemoryDirectory {
    fn claim_one_time_key(
        &self,
        device: &DeviceKey,
    ) -> impl Future<Output = Result<Option<ClaimedOneTimeKey>, TransportError>> + Send {
        std::future::ready(self.claim(device))
    }

    fn upload_device_keys(&self, keys: &SignedDeviceKeys) -> impl Future<Output = Result<(), TransportError>> + Send {
        std::future::ready(self.store_device_keys(keys))
    }

    fn upload_one_time_keys(&self, upload: &OneTimeKeyUpload) -> impl Future<Output = Result<(), TransportError>> + Send {
        std::future::ready(self.store_one_time_keys(upload))
    }

    fn set_dehydrated_device(
        &self,
        request: &DehydratedDeviceRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        std::future::ready(self.store_dehydrated(request))
    }
}
