//! Boundary to the key directory (the server-side key store).
//!
//! The engine performs no I/O of its own. Everything that must reach the
//! directory goes through [`KeyDirectory`]; everything addressed to other
//! devices leaves as [`crate::EngineAction`]s.

use std::{collections::BTreeMap, future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::{
    dehydration::DehydratedDeviceRequest,
    identity::SignedDeviceKeys,
    ids::{DeviceKey, UserId},
    retry::Retryable,
};

/// Directory call failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Directory unreachable or returned a server error
    #[error("directory unavailable: {reason}")]
    Unavailable {
        /// Transport message
        reason: String,
    },

    /// Directory refused the request
    #[error("directory rejected request: {reason}")]
    Rejected {
        /// Server message
        reason: String,
    },

    /// Call did not finish in time
    #[error("directory call timed out after {after_ms}ms")]
    Timeout {
        /// Per-attempt timeout that elapsed
        after_ms: u64,
    },
}

impl Retryable for TransportError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout { after_ms: after.as_millis() as u64 }
    }
}

/// A published Curve25519 key with its owner's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKey {
    /// Base64 Curve25519 key
    pub key: String,
    /// Marks the device's fallback key
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
    /// `user → "ed25519:<device_id>" → base64 signature`
    #[serde(default)]
    pub signatures: BTreeMap<UserId, BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct CanonicalKey<'a> {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    fallback: bool,
    key: &'a str,
}

impl SignedKey {
    /// Unsigned key.
    pub fn new(key: Curve25519PublicKey, fallback: bool) -> Self {
        Self { key: key.to_base64(), fallback, signatures: BTreeMap::new() }
    }

    /// Bytes covered by the signature.
    #[allow(clippy::expect_used)]
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&CanonicalKey { fallback: self.fallback, key: &self.key })
            .expect("invariant: a bool and a string always serialize")
    }

    /// Attach the owner's signature.
    pub fn add_signature(&mut self, owner: &DeviceKey, signature: &Ed25519Signature) {
        self.signatures
            .entry(owner.user_id.clone())
            .or_default()
            .insert(format!("ed25519:{}", owner.device_id), signature.to_base64());
    }

    /// True if `owner` signed this key with `signing_key`.
    pub fn verify(&self, owner: &DeviceKey, signing_key: &Ed25519PublicKey) -> bool {
        self.signatures
            .get(&owner.user_id)
            .and_then(|sigs| sigs.get(&format!("ed25519:{}", owner.device_id)))
            .and_then(|encoded| Ed25519Signature::from_base64(encoded).ok())
            .is_some_and(|sig| signing_key.verify(self.canonical_json().as_bytes(), &sig).is_ok())
    }

    /// Parse the Curve25519 key.
    pub fn curve25519(&self) -> Option<Curve25519PublicKey> {
        Curve25519PublicKey::from_base64(&self.key).ok()
    }
}

/// Batch of one-time and fallback keys for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKeyUpload {
    /// Owning device
    pub device: DeviceKey,
    /// `"signed_curve25519:<key id>" → key`
    pub one_time_keys: BTreeMap<String, SignedKey>,
    /// `"signed_curve25519:<key id>" → key`
    pub fallback_keys: BTreeMap<String, SignedKey>,
}

impl OneTimeKeyUpload {
    /// Nothing to upload.
    pub fn is_empty(&self) -> bool {
        self.one_time_keys.is_empty() && self.fallback_keys.is_empty()
    }
}

/// Key handed out by a claim. Fallback keys may be handed out repeatedly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedOneTimeKey {
    /// Directory key id
    pub key_id: String,
    /// The signed key
    pub key: SignedKey,
}

/// Server-side key store.
///
/// Implementations must be cancel-safe: the engine wraps every call in a
/// timeout and may drop the future.
pub trait KeyDirectory: Clone + Send + Sync + 'static {
    /// Claim one one-time key of `device`, falling back to its fallback key.
    ///
    /// `Ok(None)` means the device has neither.
    fn claim_one_time_key(
        &self,
        device: &DeviceKey,
    ) -> impl Future<Output = Result<Option<ClaimedOneTimeKey>, TransportError>> + Send;

    /// Publish signed device keys.
    fn upload_device_keys(
        &self,
        keys: &SignedDeviceKeys,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publish one-time and fallback keys.
    fn upload_one_time_keys(
        &self,
        upload: &OneTimeKeyUpload,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Store a dehydrated device blob.
    fn set_dehydrated_device(
        &self,
        request: &DehydratedDeviceRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use vodozemac::olm::Account;

    use super::*;

    #[test]
    fn signed_key_verifies_only_for_owner_key() {
        let account = Account::new();
        let owner = DeviceKey::new("@a:hs", "A");
        let mut key = SignedKey::new(account.curve25519_key(), false);
        key.add_signature(&owner, &account.sign(key.canonical_json().as_str()));

        assert!(key.verify(&owner, &account.ed25519_key()));
        assert!(!key.verify(&owner, &Account::new().ed25519_key()));
        assert!(!key.verify(&DeviceKey::new("@a:hs", "B"), &account.ed25519_key()));
    }

    #[test]
    fn fallback_flag_is_signed() {
        let account = Account::new();
        let owner = DeviceKey::new("@a:hs", "A");
        let mut key = SignedKey::new(account.curve25519_key(), true);
        key.add_signature(&owner, &account.sign(key.canonical_json().as_str()));

        key.fallback = false;
        assert!(!key.verify(&owner, &account.ed25519_key()));
    }

    #[test]
    fn timeouts_and_outages_are_transient() {
        assert!(TransportError::timed_out(Duration::from_secs(1)).is_transient());
        assert!(TransportError::Unavailable { reason: "503".into() }.is_transient());
        assert!(!TransportError::Rejected { reason: "400".into() }.is_transient());
    }
}
