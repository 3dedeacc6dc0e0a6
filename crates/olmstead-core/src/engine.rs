//! Top-level engine wiring every component behind one narrow API.
//!
//! Incoming to-device events go through [`CryptoEngine::receive_to_device`];
//! outgoing effects come back as [`EngineAction`]s for the caller to execute.
//! Directory calls (key uploads, one-time key claims) are the only I/O the
//! engine performs itself, through the injected [`KeyDirectory`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    account::OwnAccount,
    action::EngineAction,
    config::EngineConfig,
    dehydration::{DehydratedDevice, DehydrationError, DehydrationKey, DehydrationService, RehydratedDevice, UploadableDevicePackage},
    env::Environment,
    error::DecryptionError,
    gossip::{GossipError, IncomingKeyRequest, KeyGossipCoordinator},
    identity::{DeviceIdentity, IdentityError, IdentityStore, SignedDeviceKeys, TrustLevel},
    ids::{DeviceKey, RoomId, UserId},
    locks::{KeyedLocks, LockArbiter},
    megolm::{DecryptedRoomEvent, GroupError, GroupSessionManager, ImportSummary},
    olm::{OlmChannelManager, OlmError},
    pickle::PickleKey,
    retry::with_backoff,
    session_repository::{InboundGroupKey, SessionRepository},
    storage::{StorageError, Store},
    transport::{KeyDirectory, TransportError},
    wire::{EncryptedRoomMessage, OlmContent, ToDeviceContent, ToDeviceMessage},
};

/// Any engine failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Storage failed
    #[error(transparent)]
    Store(#[from] StorageError),

    /// Identity or account failure
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Pairwise channel failure
    #[error(transparent)]
    Olm(#[from] OlmError),

    /// Group channel failure
    #[error(transparent)]
    Group(#[from] GroupError),

    /// Key gossip failure
    #[error(transparent)]
    Gossip(#[from] GossipError),

    /// Dehydration failure
    #[error(transparent)]
    Dehydration(#[from] DehydrationError),

    /// Directory call failed after retries
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Incoming message rejected
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
}

/// Builds a [`CryptoEngine`].
pub struct EngineBuilder<S: Store, D: KeyDirectory, E: Environment> {
    owner: DeviceKey,
    pickle_key: PickleKey,
    store: S,
    directory: D,
    env: E,
    config: EngineConfig,
    locks: Option<Arc<dyn LockArbiter>>,
    rehydrated: Option<RehydratedDevice>,
}

impl<S: Store, D: KeyDirectory, E: Environment> EngineBuilder<S, D, E> {
    /// Override the default configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Substitute the lock arbiter.
    #[must_use]
    pub fn lock_arbiter(mut self, locks: Arc<dyn LockArbiter>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Start from a rehydrated device instead of a stored or new account.
    ///
    /// The engine takes over the rehydrated device id.
    #[must_use]
    pub fn rehydrated(mut self, device: RehydratedDevice) -> Self {
        self.owner = DeviceKey::new(self.owner.user_id.clone(), device.identity.device_id.clone());
        self.rehydrated = Some(device);
        self
    }

    /// Load or create the account and wire every component.
    ///
    /// # Errors
    ///
    /// - `Identity` if the stored account cannot be unpickled
    pub fn open(self) -> Result<CryptoEngine<S, D, E>, EngineError> {
        let identities = IdentityStore::new(self.store.clone());
        let sessions = SessionRepository::new(self.store, self.pickle_key.clone());
        let locks = self.locks.unwrap_or_else(|| Arc::new(KeyedLocks::new()));

        let account = Arc::new(match self.rehydrated {
            Some(device) => OwnAccount::adopt(self.owner, device.account, self.pickle_key, identities.clone())?,
            None => OwnAccount::load_or_create(self.owner, self.pickle_key, identities.clone())?,
        });

        let olm = Arc::new(OlmChannelManager::new(
            Arc::clone(&account),
            identities.clone(),
            sessions.clone(),
            self.directory.clone(),
            self.env.clone(),
            Arc::clone(&locks),
            self.config.clone(),
        ));
        let group = Arc::new(GroupSessionManager::new(
            Arc::clone(&account),
            sessions.clone(),
            Arc::clone(&olm),
            self.env.clone(),
            locks,
            self.config.clone(),
        ));
        let gossip = KeyGossipCoordinator::new(
            Arc::clone(&account),
            identities.clone(),
            sessions.clone(),
            Arc::clone(&olm),
            Arc::clone(&group),
            self.env.clone(),
        );
        let dehydration = DehydrationService::new(Arc::clone(&account), self.directory.clone(), self.env.clone());

        info!(device = %account.owner(), identity_key = %account.identity_key().to_base64(), "engine opened");

        Ok(CryptoEngine {
            account,
            identities,
            sessions,
            olm,
            group,
            gossip,
            dehydration,
            directory: self.directory,
            env: self.env,
            config: self.config,
        })
    }
}

/// The session and key-distribution engine for one device.
pub struct CryptoEngine<S: Store, D: KeyDirectory, E: Environment> {
    account: Arc<OwnAccount<S>>,
    identities: IdentityStore<S>,
    sessions: SessionRepository<S>,
    olm: Arc<OlmChannelManager<S, D, E>>,
    group: Arc<GroupSessionManager<S, D, E>>,
    gossip: KeyGossipCoordinator<S, D, E>,
    dehydration: DehydrationService<S, D, E>,
    directory: D,
    env: E,
    config: EngineConfig,
}

impl<S: Store, D: KeyDirectory, E: Environment> CryptoEngine<S, D, E> {
    /// Start building an engine for `owner`.
    pub fn builder(owner: DeviceKey, pickle_key: PickleKey, store: S, directory: D, env: E) -> EngineBuilder<S, D, E> {
        EngineBuilder {
            owner,
            pickle_key,
            store,
            directory,
            env,
            config: EngineConfig::default(),
            locks: None,
            rehydrated: None,
        }
    }

    /// Our `(user, device)`.
    pub fn owner(&self) -> &DeviceKey {
        self.account.owner()
    }

    /// Our Curve25519 identity key.
    pub fn identity_key(&self) -> Curve25519PublicKey {
        self.account.identity_key()
    }

    /// Our Ed25519 signing key.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.account.signing_key()
    }

    /// Our self-signed device keys.
    pub fn device_keys(&self) -> SignedDeviceKeys {
        self.account.device_keys()
    }

    /// Our public identity as other devices see it.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            user_id: self.owner().user_id.clone(),
            device_id: self.owner().device_id.clone(),
            signing_key: self.signing_key(),
            identity_key: self.identity_key(),
            algorithms: self.device_keys().algorithms,
            trust: TrustLevel::LocallyVerified,
            blocked: false,
            display_name: None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Upload device keys and top up one-time keys.
    pub async fn publish_keys(&self) -> Result<(), EngineError> {
        let device_keys = self.account.device_keys();
        let directory = &self.directory;
        let keys = &device_keys;
        with_backoff(&self.env, &self.config.retry, "upload_device_keys", move || directory.upload_device_keys(keys))
            .await?;

        let upload = self.account.one_time_keys_for_upload(self.config.one_time_key_target)?;
        if !upload.is_empty() {
            let upload_ref = &upload;
            with_backoff(&self.env, &self.config.retry, "upload_one_time_keys", move || {
                directory.upload_one_time_keys(upload_ref)
            })
            .await?;
            self.account.mark_published()?;
        }

        info!(one_time_keys = upload.one_time_keys.len(), fallback = upload.fallback_keys.len(), "published keys");
        Ok(())
    }

    /// Verify and store downloaded device keys.
    pub fn receive_device_keys(&self, keys: &SignedDeviceKeys) -> Result<DeviceIdentity, EngineError> {
        Ok(self.identities.receive_device_keys(keys)?)
    }

    /// Look up a known device.
    pub fn device(&self, device: &DeviceKey) -> Result<Option<DeviceIdentity>, EngineError> {
        Ok(self.identities.device(device)?)
    }

    /// Encrypt a room message for the room's current device list.
    ///
    /// Devices whose keys were never downloaded are skipped.
    pub async fn encrypt_room_message(
        &self,
        room: &RoomId,
        recipients: &[DeviceKey],
        plaintext: &[u8],
    ) -> Result<(EncryptedRoomMessage, Vec<EngineAction>), EngineError> {
        let mut devices = Vec::with_capacity(recipients.len());
        for key in recipients {
            match self.identities.device(key)? {
                Some(device) => devices.push(device),
                None => warn!(room = %room, device = %key, "recipient keys unknown, skipping"),
            }
        }

        let encrypted = self.group.encrypt_for_room(room, &devices, plaintext).await?;
        let actions = encrypted.to_device.into_iter().map(EngineAction::SendToDevice).collect();
        Ok((encrypted.message, actions))
    }

    /// Decrypt a room message. On a missing key, follow up with
    /// [`Self::request_room_key`].
    pub async fn decrypt_room_message(&self, event: &EncryptedRoomMessage) -> Result<DecryptedRoomEvent, DecryptionError> {
        self.group
            .decrypt(&event.room_id, &event.sender_key, &event.session_id, &event.ciphertext, event.message_index)
            .await
    }

    /// Request the key for an undecryptable room message from `sender` and
    /// our own other devices.
    pub async fn request_room_key(&self, sender: &UserId, event: &EncryptedRoomMessage) -> Result<Vec<EngineAction>, EngineError> {
        Ok(self.gossip.request_missing_key(&event.room_id, sender, &event.sender_key, &event.session_id).await?)
    }

    /// Withdraw a key request.
    pub async fn cancel_key_request(&self, room: &RoomId, session_id: &str) -> Result<Vec<EngineAction>, EngineError> {
        Ok(self.gossip.cancel_key_request(room, session_id).await?)
    }

    /// Handle one to-device event.
    pub async fn receive_to_device(&self, message: &ToDeviceMessage) -> Result<Vec<EngineAction>, EngineError> {
        if &message.recipient != self.owner() {
            debug!(recipient = %message.recipient, "to-device event for another device");
            return Ok(Vec::new());
        }

        match &message.content {
            ToDeviceContent::Encrypted(envelope) => {
                let decrypted = self.olm.decrypt_payload(envelope).await?;
                match &decrypted.payload.content {
                    OlmContent::RoomKey(content) => {
                        let sender_key = decrypted.sender_key.to_base64();
                        let installed = self.group.receive_room_key(&sender_key, content).await?;
                        if !installed {
                            return Ok(Vec::new());
                        }
                        let session = InboundGroupKey {
                            room_id: content.room_id.clone(),
                            sender_key,
                            session_id: content.session_id.clone(),
                        };
                        let mut actions = vec![EngineAction::RoomKeyReceived { session: session.clone(), forwarded: false }];
                        actions.extend(self.gossip.on_key_installed(&session).await?);
                        Ok(actions)
                    },
                    OlmContent::ForwardedRoomKey(forward) => {
                        Ok(self.gossip.receive_forwarded_key(&decrypted, forward).await?)
                    },
                    OlmContent::Dummy => {
                        debug!(sender = %envelope.sender_key, "received dummy");
                        Ok(Vec::new())
                    },
                }
            },
            ToDeviceContent::KeyRequest(request) => Ok(self.gossip.handle_key_request(&message.sender, request).await?.1),
            ToDeviceContent::Withheld(withheld) => Ok(self.gossip.receive_withheld(&message.sender, withheld).await?),
            ToDeviceContent::SessionStale(notice) => {
                self.olm.handle_stale_notice(&message.sender, notice)?;
                Ok(Vec::new())
            },
        }
    }

    /// Force rotation of the room's outbound session.
    pub async fn invalidate_room(&self, room: &RoomId) -> Result<(), EngineError> {
        Ok(self.group.invalidate_room(room).await?)
    }

    /// Mark a device verified and release its held key requests.
    pub async fn verify_device(&self, device: &DeviceKey) -> Result<Vec<EngineAction>, EngineError> {
        self.identities.set_trust(device, TrustLevel::LocallyVerified)?;
        info!(device = %device, "device verified");
        Ok(self.gossip.on_device_verified(device).await?)
    }

    /// Block or unblock a device.
    pub fn set_device_blocked(&self, device: &DeviceKey, blocked: bool) -> Result<(), EngineError> {
        self.identities.set_blocked(device, blocked)?;
        Ok(())
    }

    /// Apply the user's share decision for a device's held requests.
    pub async fn resolve_share_decision(&self, device: &DeviceKey, share: bool) -> Result<Vec<EngineAction>, EngineError> {
        Ok(self.gossip.resolve_share_decision(device, share).await?)
    }

    /// Requests held for a user decision.
    pub fn pending_share_decisions(&self, device: &DeviceKey) -> Vec<IncomingKeyRequest> {
        self.gossip.pending_decisions(device)
    }

    /// Repair wedged pairwise sessions.
    pub async fn unwedge_devices(&self) -> Result<Vec<EngineAction>, EngineError> {
        Ok(self.olm.unwedge_devices().await?.into_iter().map(EngineAction::SendToDevice).collect())
    }

    /// Id of the current pairwise session with `device`.
    pub fn current_session_id(&self, device: &DeviceIdentity) -> Result<Option<String>, EngineError> {
        Ok(self.olm.current_session_id(&device.identity_key)?)
    }

    /// Export every inbound room key under a passphrase.
    pub fn export_room_keys(&self, passphrase: &str) -> Result<String, EngineError> {
        Ok(self.group.export_room_keys(passphrase, self.config.export_rounds)?)
    }

    /// Import room keys from an export file.
    pub async fn import_room_keys(&self, armored: &str, passphrase: &str) -> Result<ImportSummary, EngineError> {
        Ok(self.group.import_room_keys(armored, passphrase).await?)
    }

    /// Create and publish a dehydrated device.
    pub async fn create_dehydrated_device(
        &self,
        key: &DehydrationKey,
        display_name: &str,
    ) -> Result<UploadableDevicePackage, EngineError> {
        let package = self.dehydration.dehydrate(key, display_name);
        self.dehydration.publish_dehydrated_device(&package).await?;
        Ok(package)
    }

    /// Restore a dehydrated device of our user.
    pub fn rehydrate(&self, key: &DehydrationKey, device: &DehydratedDevice) -> Result<RehydratedDevice, EngineError> {
        Ok(self.dehydration.rehydrate(key, device)?)
    }

    /// Pairwise channel manager.
    pub fn olm(&self) -> &OlmChannelManager<S, D, E> {
        &self.olm
    }

    /// Group session manager.
    pub fn group(&self) -> &GroupSessionManager<S, D, E> {
        &self.group
    }

    /// Drop all keys, sessions and in-memory registries.
    pub fn logout(&self) -> Result<(), EngineError> {
        self.gossip.clear();
        self.olm.clear();
        self.sessions.clear()?;
        self.identities.clear()?;
        info!(device = %self.owner(), "logged out");
        Ok(())
    }
}
