//! This device's long-term account.
//!
//! The vodozemac account holds the identity keys and the unpublished
//! one-time keys. It is only ever touched under a short synchronous lock,
//! never across an await point.

#![allow(clippy::disallowed_types, reason = "Account lock is only held synchronously")]

use std::sync::{Mutex, MutexGuard, PoisonError};

use vodozemac::{
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature,
    olm::{Account, InboundCreationResult, PreKeyMessage, Session, SessionConfig, SessionCreationError},
};

use crate::{
    identity::{IdentityError, IdentityStore, SignedDeviceKeys},
    ids::DeviceKey,
    pickle::PickleKey,
    storage::{Store, WriteOp},
    transport::{OneTimeKeyUpload, SignedKey},
};

/// Own account plus the key that protects it at rest.
pub struct OwnAccount<S: Store> {
    owner: DeviceKey,
    account: Mutex<Account>,
    pickle_key: PickleKey,
    identities: IdentityStore<S>,
}

impl<S: Store> OwnAccount<S> {
    /// Load the stored account, or create and persist a new one for `owner`.
    ///
    /// # Errors
    ///
    /// - `Store(Corrupted)` if a stored account does not unpickle under `pickle_key`
    pub fn load_or_create(
        owner: DeviceKey,
        pickle_key: PickleKey,
        identities: IdentityStore<S>,
    ) -> Result<Self, IdentityError> {
        let account = match identities.load_account(&pickle_key)? {
            Some((stored_owner, account)) if stored_owner == owner => account,
            Some((stored_owner, _)) => {
                tracing::warn!(stored = %stored_owner, requested = %owner, "stored account belongs to another device, replacing");
                Self::fresh(&owner, &pickle_key, &identities)?
            },
            None => Self::fresh(&owner, &pickle_key, &identities)?,
        };

        Ok(Self { owner, account: Mutex::new(account), pickle_key, identities })
    }

    /// Wrap an account restored from elsewhere (rehydration) and persist it.
    pub fn adopt(
        owner: DeviceKey,
        account: Account,
        pickle_key: PickleKey,
        identities: IdentityStore<S>,
    ) -> Result<Self, IdentityError> {
        identities.save_account(&owner, &account, &pickle_key)?;
        Ok(Self { owner, account: Mutex::new(account), pickle_key, identities })
    }

    fn fresh(
        owner: &DeviceKey,
        pickle_key: &PickleKey,
        identities: &IdentityStore<S>,
    ) -> Result<Account, IdentityError> {
        let account = Account::new();
        identities.save_account(owner, &account, pickle_key)?;
        tracing::info!(device = %owner, identity_key = %account.curve25519_key().to_base64(), "created account");
        Ok(account)
    }

    fn lock(&self) -> MutexGuard<'_, Account> {
        self.account.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Our `(user, device)`.
    pub fn owner(&self) -> &DeviceKey {
        &self.owner
    }

    /// Curve25519 identity key.
    pub fn identity_key(&self) -> Curve25519PublicKey {
        self.lock().curve25519_key()
    }

    /// Ed25519 signing key.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.lock().ed25519_key()
    }

    /// Sign arbitrary canonical JSON.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.lock().sign(message)
    }

    /// Self-signed device keys for upload.
    pub fn device_keys(&self) -> SignedDeviceKeys {
        device_keys_for(&self.owner, &self.lock())
    }

    /// Generate one-time keys up to `target` and return everything unpublished.
    ///
    /// Also makes sure a fallback key exists. Call [`Self::mark_published`]
    /// once the directory accepted the upload.
    pub fn one_time_keys_for_upload(&self, target: usize) -> Result<OneTimeKeyUpload, IdentityError> {
        let mut account = self.lock();

        let unpublished = account.one_time_keys().len();
        let wanted = target.min(account.max_number_of_one_time_keys()).saturating_sub(unpublished);
        if wanted > 0 {
            let _ = account.generate_one_time_keys(wanted);
        }
        if account.fallback_key().is_empty() {
            let _ = account.generate_fallback_key();
        }

        let upload = signed_key_upload(&self.owner, &account);
        self.identities.save_account(&self.owner, &account, &self.pickle_key)?;
        Ok(upload)
    }

    /// Forget generated keys as unpublished after a successful upload.
    pub fn mark_published(&self) -> Result<(), IdentityError> {
        let mut account = self.lock();
        account.mark_keys_as_published();
        self.identities.save_account(&self.owner, &account, &self.pickle_key)
    }

    /// Start an outbound pairwise session from a claimed key.
    pub fn create_outbound_session(
        &self,
        identity_key: Curve25519PublicKey,
        one_time_key: Curve25519PublicKey,
    ) -> Session {
        self.lock().create_outbound_session(SessionConfig::version_1(), identity_key, one_time_key)
    }

    /// Create an inbound session from a pre-key message.
    ///
    /// Consumes the one-time key it was addressed to. Returns the result plus
    /// the write that persists the updated account; the caller must commit
    /// it in the same batch as the new session.
    pub fn create_inbound_session(
        &self,
        identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<(InboundCreationResult, WriteOp), InboundSessionError> {
        let mut account = self.lock();
        let result = account.create_inbound_session(identity_key, message)?;
        let op = self.identities.account_op(&self.owner, &account, &self.pickle_key)?;
        Ok((result, op))
    }

    /// Pickle key protecting stored ratchets.
    pub fn pickle_key(&self) -> &PickleKey {
        &self.pickle_key
    }
}

/// Failure creating an inbound session.
#[derive(Debug, thiserror::Error)]
pub enum InboundSessionError {
    /// Ratchet rejected the pre-key message
    #[error(transparent)]
    Creation(#[from] SessionCreationError),
    /// Account could not be persisted
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Self-signed device keys for an arbitrary account.
pub(crate) fn device_keys_for(owner: &DeviceKey, account: &Account) -> SignedDeviceKeys {
    let mut keys = SignedDeviceKeys::new(
        owner.user_id.clone(),
        owner.device_id.clone(),
        account.curve25519_key(),
        account.ed25519_key(),
    );
    let signature = account.sign(keys.canonical_json().as_str());
    keys.add_signature(owner, &signature);
    keys
}

/// Every unpublished one-time and fallback key of `account`, signed by it.
pub(crate) fn signed_key_upload(owner: &DeviceKey, account: &Account) -> OneTimeKeyUpload {
    let sign = |key: Curve25519PublicKey, fallback: bool| {
        let mut signed = SignedKey::new(key, fallback);
        signed.add_signature(owner, &account.sign(signed.canonical_json().as_str()));
        signed
    };

    OneTimeKeyUpload {
        device: owner.clone(),
        one_time_keys: account
            .one_time_keys()
            .into_iter()
            .map(|(id, key)| (format!("signed_curve25519:{}", id.to_base64()), sign(key, false)))
            .collect(),
        fallback_keys: account
            .fallback_key()
            .into_iter()
            .map(|(id, key)| (format!("signed_curve25519:{}", id.to_base64()), sign(key, true)))
            .collect(),
    }
}
