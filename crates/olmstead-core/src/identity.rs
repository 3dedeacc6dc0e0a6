//! Device identities, trust levels and the identity store.
//!
//! Remote devices enter the store only through [`IdentityStore::receive_device_keys`],
//! which checks the device's self-signature first. After that, the only
//! mutations are trust changes from verification flows and the local block
//! flag. Nothing is deleted except by [`IdentityStore::clear`] on logout.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use vodozemac::{
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature,
    olm::{Account, AccountPickle},
};

use crate::{
    ids::{DeviceId, DeviceKey, UserId},
    pickle::PickleKey,
    storage::{RecordStore, StorageError, Store, Table, WriteOp, key, put_op},
};

/// Pairwise channel algorithm identifier.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// Group channel algorithm identifier.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

const ACCOUNT_ROW: &[u8] = b"account";

/// Identity store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Underlying store failed
    #[error(transparent)]
    Store(#[from] StorageError),

    /// A public key could not be parsed
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Parser message
        reason: String,
    },

    /// Signature missing or not valid for the signed content
    #[error("invalid signature on device keys for {device}")]
    InvalidSignature {
        /// Device whose keys failed verification
        device: DeviceKey,
    },

    /// A known device presented different long-term keys
    #[error("device {device} presented changed identity keys")]
    KeysChanged {
        /// Device whose keys changed
        device: DeviceKey,
    },

    /// Device not in the store
    #[error("unknown device {device}")]
    UnknownDevice {
        /// The missing device
        device: DeviceKey,
    },
}

/// Verification status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Never verified
    Unknown,
    /// Verified manually on this device
    LocallyVerified,
    /// Verified through the owner's cross-signing keys
    CrossSigningVerified,
}

/// Serde adapters storing vodozemac keys as unpadded base64.
pub(crate) mod key_serde {
    /// Curve25519 public keys.
    pub mod curve25519 {
        use serde::{Deserialize, Deserializer, Serializer, de::Error};
        use vodozemac::Curve25519PublicKey;

        /// Serialize as base64.
        pub fn serialize<S: Serializer>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&key.to_base64())
        }

        /// Deserialize from base64.
        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Curve25519PublicKey, D::Error> {
            let encoded = String::deserialize(d)?;
            Curve25519PublicKey::from_base64(&encoded).map_err(D::Error::custom)
        }
    }

    /// Ed25519 public keys.
    pub mod ed25519 {
        use serde::{Deserialize, Deserializer, Serializer, de::Error};
        use vodozemac::Ed25519PublicKey;

        /// Serialize as base64.
        pub fn serialize<S: Serializer>(key: &Ed25519PublicKey, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&key.to_base64())
        }

        /// Deserialize from base64.
        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Ed25519PublicKey, D::Error> {
            let encoded = String::deserialize(d)?;
            Ed25519PublicKey::from_base64(&encoded).map_err(D::Error::custom)
        }
    }
}

/// A device's public identity and our trust in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Owning user
    pub user_id: UserId,
    /// Device id
    pub device_id: DeviceId,
    /// Long-term signing key
    #[serde(with = "key_serde::ed25519")]
    pub signing_key: Ed25519PublicKey,
    /// Long-term identity key used for pairwise handshakes
    #[serde(with = "key_serde::curve25519")]
    pub identity_key: Curve25519PublicKey,
    /// Algorithms the device advertises
    pub algorithms: Vec<String>,
    /// Verification status
    pub trust: TrustLevel,
    /// Locally blacklisted: never receives room keys
    #[serde(default)]
    pub blocked: bool,
    /// Human-readable name, if known
    #[serde(default)]
    pub display_name: Option<String>,
}

impl DeviceIdentity {
    /// Composite `(user, device)` key.
    pub fn key(&self) -> DeviceKey {
        DeviceKey { user_id: self.user_id.clone(), device_id: self.device_id.clone() }
    }

    /// True for locally or cross-signing verified devices.
    pub fn is_verified(&self) -> bool {
        self.trust != TrustLevel::Unknown
    }
}

/// Device keys as published to the key directory.
///
/// The signed content is the canonical JSON of every field except
/// `signatures`; see [`SignedDeviceKeys::canonical_json`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDeviceKeys {
    /// Owning user
    pub user_id: UserId,
    /// Device id
    pub device_id: DeviceId,
    /// Supported algorithms
    pub algorithms: Vec<String>,
    /// `"<algorithm>:<device_id>" → base64 key`
    pub keys: BTreeMap<String, String>,
    /// `user → "ed25519:<device_id>" → base64 signature`
    #[serde(default)]
    pub signatures: BTreeMap<UserId, BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct CanonicalDeviceKeys<'a> {
    algorithms: &'a [String],
    device_id: &'a DeviceId,
    keys: &'a BTreeMap<String, String>,
    user_id: &'a UserId,
}

impl SignedDeviceKeys {
    /// Unsigned device keys for the given long-term keys.
    pub fn new(
        user_id: UserId,
        device_id: DeviceId,
        identity_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
    ) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(format!("curve25519:{device_id}"), identity_key.to_base64());
        keys.insert(format!("ed25519:{device_id}"), signing_key.to_base64());

        Self {
            user_id,
            device_id,
            algorithms: vec![OLM_ALGORITHM.to_owned(), MEGOLM_ALGORITHM.to_owned()],
            keys,
            signatures: BTreeMap::new(),
        }
    }

    /// Bytes covered by signatures: sorted-key JSON without `signatures`.
    #[allow(clippy::expect_used)]
    pub fn canonical_json(&self) -> String {
        let canonical = CanonicalDeviceKeys {
            algorithms: &self.algorithms,
            device_id: &self.device_id,
            keys: &self.keys,
            user_id: &self.user_id,
        };
        serde_json::to_string(&canonical).expect("invariant: strings and string maps always serialize")
    }

    /// The advertised Curve25519 identity key.
    pub fn identity_key(&self) -> Result<Curve25519PublicKey, IdentityError> {
        let encoded = self.key_for("curve25519")?;
        Curve25519PublicKey::from_base64(encoded)
            .map_err(|e| IdentityError::InvalidKey { reason: e.to_string() })
    }

    /// The advertised Ed25519 signing key.
    pub fn signing_key(&self) -> Result<Ed25519PublicKey, IdentityError> {
        let encoded = self.key_for("ed25519")?;
        Ed25519PublicKey::from_base64(encoded)
            .map_err(|e| IdentityError::InvalidKey { reason: e.to_string() })
    }

    fn key_for(&self, algorithm: &str) -> Result<&str, IdentityError> {
        self.keys
            .get(&format!("{algorithm}:{}", self.device_id))
            .map(String::as_str)
            .ok_or_else(|| IdentityError::InvalidKey { reason: format!("missing {algorithm} key") })
    }

    /// Attach a signature made by `signer`'s Ed25519 key.
    pub fn add_signature(&mut self, signer: &DeviceKey, signature: &Ed25519Signature) {
        self.signatures
            .entry(signer.user_id.clone())
            .or_default()
            .insert(format!("ed25519:{}", signer.device_id), signature.to_base64());
    }

    /// Check the signature `signer` placed on these keys.
    pub fn verify_signature(
        &self,
        signer: &DeviceKey,
        signer_key: &Ed25519PublicKey,
    ) -> Result<(), IdentityError> {
        let invalid = || IdentityError::InvalidSignature { device: self.device_key() };

        let encoded = self
            .signatures
            .get(&signer.user_id)
            .and_then(|sigs| sigs.get(&format!("ed25519:{}", signer.device_id)))
            .ok_or_else(invalid)?;
        let signature = Ed25519Signature::from_base64(encoded).map_err(|_| invalid())?;

        signer_key.verify(self.canonical_json().as_bytes(), &signature).map_err(|_| invalid())
    }

    /// Check the device signed its own keys.
    pub fn verify_self_signature(&self) -> Result<(), IdentityError> {
        self.verify_signature(&self.device_key(), &self.signing_key()?)
    }

    /// Composite key of the described device.
    pub fn device_key(&self) -> DeviceKey {
        DeviceKey { user_id: self.user_id.clone(), device_id: self.device_id.clone() }
    }
}

/// Own account row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredAccount {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub pickle: String,
}

/// Persists own account, remote device identities and their trust.
#[derive(Clone)]
pub struct IdentityStore<S: Store> {
    store: S,
}

impl<S: Store> IdentityStore<S> {
    /// Wrap a store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Load and unpickle our own account, if one was saved.
    pub fn load_account(
        &self,
        pickle_key: &PickleKey,
    ) -> Result<Option<(DeviceKey, Account)>, IdentityError> {
        let Some(stored) = self.store.load::<StoredAccount>(Table::Account, ACCOUNT_ROW)? else {
            return Ok(None);
        };

        let pickle = AccountPickle::from_encrypted(&stored.pickle, pickle_key.as_bytes())
            .map_err(|e| StorageError::Corrupted(format!("account pickle: {e}")))?;

        Ok(Some((DeviceKey::new(stored.user_id, stored.device_id), Account::from_pickle(pickle))))
    }

    /// Write operation persisting our account; batch it with whatever the
    /// account change produced (e.g. a new inbound session).
    pub fn account_op(
        &self,
        owner: &DeviceKey,
        account: &Account,
        pickle_key: &PickleKey,
    ) -> Result<WriteOp, IdentityError> {
        let stored = StoredAccount {
            user_id: owner.user_id.clone(),
            device_id: owner.device_id.clone(),
            pickle: account.pickle().encrypt(pickle_key.as_bytes()),
        };
        Ok(put_op(Table::Account, ACCOUNT_ROW, &stored)?)
    }

    /// Persist the account on its own.
    pub fn save_account(
        &self,
        owner: &DeviceKey,
        account: &Account,
        pickle_key: &PickleKey,
    ) -> Result<(), IdentityError> {
        Ok(self.store.write(vec![self.account_op(owner, account, pickle_key)?])?)
    }

    /// Insert or overwrite a device together with its identity-key index.
    pub fn save_device(&self, device: &DeviceIdentity) -> Result<(), IdentityError> {
        let row = device_row(&device.key());
        let index = key::compose(&[&device.identity_key.to_base64()]);

        self.store.write(vec![
            put_op(Table::Devices, &row, device)?,
            put_op(Table::DevicesByIdentityKey, &index, &device.key())?,
        ])?;
        Ok(())
    }

    /// Look up one device.
    pub fn device(&self, device: &DeviceKey) -> Result<Option<DeviceIdentity>, IdentityError> {
        Ok(self.store.load(Table::Devices, &device_row(device))?)
    }

    /// Look up one device or fail with `UnknownDevice`.
    pub fn require_device(&self, device: &DeviceKey) -> Result<DeviceIdentity, IdentityError> {
        self.device(device)?.ok_or_else(|| IdentityError::UnknownDevice { device: device.clone() })
    }

    /// Every known device of a user, ordered by device id.
    pub fn user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceIdentity>, IdentityError> {
        Ok(self.store.load_prefix(Table::Devices, &key::prefix(&[user_id.as_str()]))?)
    }

    /// Resolve a Curve25519 identity key to its device.
    pub fn device_by_identity_key(
        &self,
        identity_key: &Curve25519PublicKey,
    ) -> Result<Option<DeviceIdentity>, IdentityError> {
        let index = key::compose(&[&identity_key.to_base64()]);
        match self.store.load::<DeviceKey>(Table::DevicesByIdentityKey, &index)? {
            Some(device) => self.device(&device),
            None => Ok(None),
        }
    }

    /// Verify and store device keys downloaded from the directory.
    ///
    /// Trust and block state of an already-known device are preserved.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if the self-signature does not verify
    /// - `KeysChanged` if a known device now advertises different keys
    pub fn receive_device_keys(&self, keys: &SignedDeviceKeys) -> Result<DeviceIdentity, IdentityError> {
        keys.verify_self_signature()?;

        let identity_key = keys.identity_key()?;
        let signing_key = keys.signing_key()?;
        let device_key = keys.device_key();

        let device = match self.device(&device_key)? {
            Some(existing)
                if existing.identity_key != identity_key || existing.signing_key != signing_key =>
            {
                warn!(device = %device_key, "device keys changed, refusing update");
                return Err(IdentityError::KeysChanged { device: device_key });
            },
            Some(existing) => DeviceIdentity { algorithms: keys.algorithms.clone(), ..existing },
            None => {
                info!(device = %device_key, "new device");
                DeviceIdentity {
                    user_id: keys.user_id.clone(),
                    device_id: keys.device_id.clone(),
                    signing_key,
                    identity_key,
                    algorithms: keys.algorithms.clone(),
                    trust: TrustLevel::Unknown,
                    blocked: false,
                    display_name: None,
                }
            },
        };

        self.save_device(&device)?;
        Ok(device)
    }

    /// Change a device's trust level.
    pub fn set_trust(&self, device: &DeviceKey, trust: TrustLevel) -> Result<DeviceIdentity, IdentityError> {
        let mut identity = self.require_device(device)?;
        identity.trust = trust;
        self.save_device(&identity)?;
        debug!(device = %device, ?trust, "trust updated");
        Ok(identity)
    }

    /// Block or unblock a device.
    pub fn set_blocked(&self, device: &DeviceKey, blocked: bool) -> Result<DeviceIdentity, IdentityError> {
        let mut identity = self.require_device(device)?;
        identity.blocked = blocked;
        self.save_device(&identity)?;
        debug!(device = %device, blocked, "block flag updated");
        Ok(identity)
    }

    /// Drop every identity and the account (logout).
    pub fn clear(&self) -> Result<(), IdentityError> {
        for table in [Table::Account, Table::Devices, Table::DevicesByIdentityKey] {
            self.store.clear(table)?;
        }
        Ok(())
    }
}

fn device_row(device: &DeviceKey) -> Vec<u8> {
    key::compose(&[device.user_id.as_str(), device.device_id.as_str()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn signed_keys(account: &Account, user: &str, device: &str) -> SignedDeviceKeys {
        let mut keys = SignedDeviceKeys::new(
            user.into(),
            device.into(),
            account.curve25519_key(),
            account.ed25519_key(),
        );
        let signature = account.sign(keys.canonical_json().as_str());
        keys.add_signature(&DeviceKey::new(user, device), &signature);
        keys
    }

    #[test]
    fn receive_device_keys_stores_verified_device() {
        let identities = IdentityStore::new(MemoryStore::new());
        let account = Account::new();
        let keys = signed_keys(&account, "@bob:hs", "BOB1");

        let device = identities.receive_device_keys(&keys).unwrap();

        assert_eq!(device.trust, TrustLevel::Unknown);
        assert_eq!(device.identity_key, account.curve25519_key());
        assert_eq!(identities.device_by_identity_key(&account.curve25519_key()).unwrap(), Some(device));
    }

    #[test]
    fn tampered_keys_rejected() {
        let identities = IdentityStore::new(MemoryStore::new());
        let account = Account::new();
        let mut keys = signed_keys(&account, "@bob:hs", "BOB1");
        keys.algorithms.push("m.fake".to_owned());

        assert!(matches!(
            identities.receive_device_keys(&keys),
            Err(IdentityError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn changed_keys_rejected_and_trust_preserved() {
        let identities = IdentityStore::new(MemoryStore::new());
        let account = Account::new();
        let keys = signed_keys(&account, "@bob:hs", "BOB1");
        identities.receive_device_keys(&keys).unwrap();
        identities.set_trust(&DeviceKey::new("@bob:hs", "BOB1"), TrustLevel::LocallyVerified).unwrap();

        let again = identities.receive_device_keys(&keys).unwrap();
        assert_eq!(again.trust, TrustLevel::LocallyVerified);

        let impostor = signed_keys(&Account::new(), "@bob:hs", "BOB1");
        assert!(matches!(
            identities.receive_device_keys(&impostor),
            Err(IdentityError::KeysChanged { .. })
        ));
    }

    #[test]
    fn user_devices_are_scoped_to_user() {
        let identities = IdentityStore::new(MemoryStore::new());
        for (user, device) in [("@bob:hs", "B1"), ("@bob:hs", "B2"), ("@bobby:hs", "X")] {
            identities.receive_device_keys(&signed_keys(&Account::new(), user, device)).unwrap();
        }

        let bob: Vec<_> = identities
            .user_devices(&UserId::new("@bob:hs"))
            .unwrap()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(bob, vec![DeviceId::new("B1"), DeviceId::new("B2")]);
    }

    #[test]
    fn account_roundtrip_under_pickle_key() {
        let identities = IdentityStore::new(MemoryStore::new());
        let account = Account::new();
        let owner = DeviceKey::new("@alice:hs", "ALICE1");
        let key = PickleKey::new([4; 32]);

        identities.save_account(&owner, &account, &key).unwrap();
        let (loaded_owner, loaded) = identities.load_account(&key).unwrap().unwrap();

        assert_eq!(loaded_owner, owner);
        assert_eq!(loaded.curve25519_key(), account.curve25519_key());
        assert!(matches!(
            identities.load_account(&PickleKey::new([5; 32])),
            Err(IdentityError::Store(StorageError::Corrupted(_)))
        ));
    }

    #[test]
    fn clear_removes_everything() {
        let identities = IdentityStore::new(MemoryStore::new());
        let account = Account::new();
        identities.receive_device_keys(&signed_keys(&account, "@bob:hs", "B1")).unwrap();
        identities.clear().unwrap();

        assert_eq!(identities.device(&DeviceKey::new("@bob:hs", "B1")).unwrap(), None);
    }
}
