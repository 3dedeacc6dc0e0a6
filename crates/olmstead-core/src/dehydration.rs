//! Device dehydration: an offline device that can receive keys while none of
//! the user's real devices are online.
//!
//! Dehydrating creates a brand-new account, pickles it under a caller key
//! and prepares everything the directory needs to treat it as a device.
//! Rehydrating unpickles it on a new login, which then answers every pre-key
//! message that was addressed to the dehydrated device.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use vodozemac::olm::{Account, AccountPickle};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    account::{OwnAccount, device_keys_for, signed_key_upload},
    env::Environment,
    identity::{DeviceIdentity, MEGOLM_ALGORITHM, OLM_ALGORITHM, SignedDeviceKeys, TrustLevel},
    ids::{DeviceId, DeviceKey, UserId},
    storage::Store,
    transport::{KeyDirectory, OneTimeKeyUpload, TransportError},
};

/// Pickle format identifier for dehydrated accounts.
pub const DEHYDRATION_ALGORITHM: &str = "org.matrix.msc2697.v1.olm.vodozemac_pickle";

/// Dehydration and rehydration failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DehydrationError {
    /// Directory refused the device blob
    #[error("failed to set dehydrated device: {0}")]
    FailedToSetDehydratedDevice(TransportError),

    /// Directory refused the device keys
    #[error("failed to upload dehydrated device keys: {0}")]
    FailedToUploadDeviceKeys(TransportError),

    /// Directory refused the one-time keys
    #[error("failed to upload dehydrated one-time keys: {0}")]
    FailedToUploadOneTimeKeys(TransportError),

    /// Blob uses a pickle format we do not understand
    #[error("unsupported dehydration algorithm {algorithm}")]
    UnsupportedAlgorithm {
        /// Algorithm named by the blob
        algorithm: String,
    },

    /// Blob did not decrypt under the key
    #[error("failed to unpickle dehydrated device: {reason}")]
    FailedToUnpickle {
        /// Unpickling error
        reason: String,
    },
}

/// 32-byte key the dehydrated account is pickled under.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DehydrationKey([u8; 32]);

impl DehydrationKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for DehydrationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DehydrationKey(..)")
    }
}

/// `device_data` of the directory request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DehydratedDeviceData {
    /// Pickle format
    pub algorithm: String,
    /// Encrypted account pickle
    pub account: String,
}

/// Body stored by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DehydratedDeviceRequest {
    /// Id of the dehydrated device
    pub device_id: DeviceId,
    /// Name shown in device lists
    pub display_name: String,
    /// The pickled account
    pub device_data: DehydratedDeviceData,
}

/// Everything needed to publish a dehydrated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadableDevicePackage {
    /// Device blob
    pub request: DehydratedDeviceRequest,
    /// Keys self-signed by the new account and counter-signed by ours
    pub device_keys: SignedDeviceKeys,
    /// One-time and fallback keys bound to the dehydrated device
    pub one_time_keys: OneTimeKeyUpload,
}

/// A dehydrated device as fetched back from the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DehydratedDevice {
    /// Device id
    pub device_id: DeviceId,
    /// The pickled account
    pub device_data: DehydratedDeviceData,
}

impl From<DehydratedDeviceRequest> for DehydratedDevice {
    fn from(request: DehydratedDeviceRequest) -> Self {
        Self { device_id: request.device_id, device_data: request.device_data }
    }
}

/// A restored device.
pub struct RehydratedDevice {
    /// Public identity of the restored device
    pub identity: DeviceIdentity,
    /// The account, with byte-identical keys
    pub account: Account,
}

/// Produces and publishes dehydrated devices.
pub struct DehydrationService<S: Store, D: KeyDirectory, E: Environment> {
    account: Arc<OwnAccount<S>>,
    directory: D,
    env: E,
}

impl<S: Store, D: KeyDirectory, E: Environment> DehydrationService<S, D, E> {
    /// Wire up a service.
    pub fn new(account: Arc<OwnAccount<S>>, directory: D, env: E) -> Self {
        Self { account, directory, env }
    }

    /// Create and pickle a fresh device account.
    ///
    /// Half the account's one-time key capacity plus a fallback key are
    /// generated. The device keys carry the new account's self-signature and
    /// a signature from our own device.
    pub fn dehydrate(&self, key: &DehydrationKey, display_name: &str) -> UploadableDevicePackage {
        let mut account = Account::new();
        let _ = account.generate_one_time_keys(account.max_number_of_one_time_keys() / 2);
        let _ = account.generate_fallback_key();

        let owner = DeviceKey::new(self.account.owner().user_id.clone(), self.env.random_id(10));

        let mut device_keys = device_keys_for(&owner, &account);
        let counter_signature = self.account.sign(&device_keys.canonical_json());
        device_keys.add_signature(self.account.owner(), &counter_signature);

        let one_time_keys = signed_key_upload(&owner, &account);
        account.mark_keys_as_published();

        info!(
            device = %owner,
            one_time_keys = one_time_keys.one_time_keys.len(),
            "dehydrated new device"
        );

        UploadableDevicePackage {
            request: DehydratedDeviceRequest {
                device_id: owner.device_id,
                display_name: display_name.to_owned(),
                device_data: DehydratedDeviceData {
                    algorithm: DEHYDRATION_ALGORITHM.to_owned(),
                    account: account.pickle().encrypt(key.as_bytes()),
                },
            },
            device_keys,
            one_time_keys,
        }
    }

    /// Upload the device blob, then its keys, then its one-time keys.
    ///
    /// Stops at the first failure; nothing is retried and no local state
    /// changes.
    pub async fn publish_dehydrated_device(&self, package: &UploadableDevicePackage) -> Result<(), DehydrationError> {
        self.directory
            .set_dehydrated_device(&package.request)
            .await
            .map_err(DehydrationError::FailedToSetDehydratedDevice)?;
        self.directory
            .upload_device_keys(&package.device_keys)
            .await
            .map_err(DehydrationError::FailedToUploadDeviceKeys)?;
        self.directory
            .upload_one_time_keys(&package.one_time_keys)
            .await
            .map_err(DehydrationError::FailedToUploadOneTimeKeys)?;

        info!(device_id = %package.request.device_id, "published dehydrated device");
        Ok(())
    }

    /// Restore a dehydrated device of our own user.
    pub fn rehydrate(&self, key: &DehydrationKey, device: &DehydratedDevice) -> Result<RehydratedDevice, DehydrationError> {
        rehydrate(key, &self.account.owner().user_id, device)
    }
}

/// Restore a dehydrated device of `user_id` without an existing account,
/// as a fresh login does.
///
/// # Errors
///
/// - `UnsupportedAlgorithm` if the blob is not a vodozemac pickle
/// - `FailedToUnpickle` if it does not decrypt under `key`
pub fn rehydrate(
    key: &DehydrationKey,
    user_id: &UserId,
    device: &DehydratedDevice,
) -> Result<RehydratedDevice, DehydrationError> {
    if device.device_data.algorithm != DEHYDRATION_ALGORITHM {
        return Err(DehydrationError::UnsupportedAlgorithm { algorithm: device.device_data.algorithm.clone() });
    }

    let pickle = AccountPickle::from_encrypted(&device.device_data.account, key.as_bytes())
        .map_err(|e| DehydrationError::FailedToUnpickle { reason: e.to_string() })?;
    let account = Account::from_pickle(pickle);

    let identity = DeviceIdentity {
        user_id: user_id.clone(),
        device_id: device.device_id.clone(),
        signing_key: account.ed25519_key(),
        identity_key: account.curve25519_key(),
        algorithms: vec![OLM_ALGORITHM.to_owned(), MEGOLM_ALGORITHM.to_owned()],
        trust: TrustLevel::LocallyVerified,
        blocked: false,
        display_name: None,
    };

    info!(device_id = %device.device_id, "rehydrated device");
    Ok(RehydratedDevice { identity, account })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pickled(key: &DehydrationKey) -> (Account, DehydratedDevice) {
        let account = Account::new();
        let device = DehydratedDevice {
            device_id: DeviceId::new("DEHYDRATED"),
            device_data: DehydratedDeviceData {
                algorithm: DEHYDRATION_ALGORITHM.to_owned(),
                account: account.pickle().encrypt(key.as_bytes()),
            },
        };
        (account, device)
    }

    #[test]
    fn rehydrated_keys_are_identical() {
        let key = DehydrationKey::new([3; 32]);
        let (account, device) = pickled(&key);

        let restored = rehydrate(&key, &UserId::new("@a:hs"), &device).unwrap();

        assert_eq!(restored.identity.identity_key.to_bytes(), account.curve25519_key().to_bytes());
        assert_eq!(restored.identity.signing_key.as_bytes(), account.ed25519_key().as_bytes());
    }

    #[test]
    fn wrong_key_fails_to_unpickle() {
        let (_, device) = pickled(&DehydrationKey::new([3; 32]));
        let result = rehydrate(&DehydrationKey::new([4; 32]), &UserId::new("@a:hs"), &device);
        assert!(matches!(result, Err(DehydrationError::FailedToUnpickle { .. })));
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let key = DehydrationKey::new([3; 32]);
        let (_, mut device) = pickled(&key);
        device.device_data.algorithm = "org.example.libolm_pickle".into();

        assert!(matches!(
            rehydrate(&key, &UserId::new("@a:hs"), &device),
            Err(DehydrationError::UnsupportedAlgorithm { .. })
        ));
    }
}
