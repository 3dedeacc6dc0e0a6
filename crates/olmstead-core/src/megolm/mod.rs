//! Group (Megolm) sessions.
//!
//! Each room has at most one active outbound session. Its key travels to
//! every member device over pairwise channels before the first message that
//! device should read; the chain index at which each device received the key
//! is recorded so it can later be re-forwarded from exactly that point.
//!
//! # Rotation
//!
//! A new outbound session replaces the current one when:
//!
//! - the room was invalidated (membership or settings changed)
//! - `rotation_period_msgs` messages were sent with it
//! - it is older than `rotation_period`
//! - it was shared with a device that is no longer a recipient
//!
//! # Invariants
//!
//! - Outbound creation, rotation and sharing run under the room's outbound lock
//! - Inbound decrypts and installs run under the room's inbound lock
//! - An installed inbound session is never replaced by one with a later
//!   first known index
//! - Each `(session, index)` decrypts at most once

mod error;
mod export;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

pub use error::GroupError;
pub use export::ImportSummary;
use tracing::{debug, info, warn};
use vodozemac::megolm::{
    ExportedSessionKey, GroupSession, InboundGroupSession, MegolmMessage, SessionConfig, SessionKey,
};

use crate::{
    account::OwnAccount,
    config::EngineConfig,
    env::Environment,
    error::DecryptionError,
    identity::{DeviceIdentity, MEGOLM_ALGORITHM},
    ids::{DeviceKey, RoomId},
    locks::{LockArbiter, LockKey},
    olm::OlmChannelManager,
    session_repository::{InboundGroupKey, InboundRoomSession, OutboundRoomSession, SessionRepository},
    storage::Store,
    transport::KeyDirectory,
    wire::{
        EncryptedRoomMessage, OlmContent, RoomKeyContent, ToDeviceContent, ToDeviceMessage, WithheldCode,
        WithheldContent,
    },
};

/// Result of encrypting a room message: the event plus any key shares that
/// must be delivered before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEncryption {
    /// The encrypted room event
    pub message: EncryptedRoomMessage,
    /// Room keys and withheld notices for newly targeted devices
    pub to_device: Vec<ToDeviceMessage>,
}

/// A decrypted room event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRoomEvent {
    /// Plaintext
    pub plaintext: Vec<u8>,
    /// Chain index it was encrypted at
    pub message_index: u32,
    /// The key came from a forward or import rather than its creator
    pub forwarded: bool,
}

/// Creates, rotates and shares outbound group sessions; decrypts with
/// inbound ones.
pub struct GroupSessionManager<S: Store, D: KeyDirectory, E: Environment> {
    account: Arc<OwnAccount<S>>,
    sessions: SessionRepository<S>,
    olm: Arc<OlmChannelManager<S, D, E>>,
    env: E,
    locks: Arc<dyn LockArbiter>,
    config: EngineConfig,
}

impl<S: Store, D: KeyDirectory, E: Environment> GroupSessionManager<S, D, E> {
    /// Wire up a manager.
    pub fn new(
        account: Arc<OwnAccount<S>>,
        sessions: SessionRepository<S>,
        olm: Arc<OlmChannelManager<S, D, E>>,
        env: E,
        locks: Arc<dyn LockArbiter>,
        config: EngineConfig,
    ) -> Self {
        Self { account, sessions, olm, env, locks, config }
    }

    /// Encrypt `plaintext` for `room`, sharing the key with any recipient
    /// that does not have it yet.
    ///
    /// `recipients` is the room's current device list. Blocked devices get a
    /// withheld notice instead of the key.
    pub async fn encrypt_for_room(
        &self,
        room: &RoomId,
        recipients: &[DeviceIdentity],
        plaintext: &[u8],
    ) -> Result<RoomEncryption, GroupError> {
        let _guard = self.locks.acquire(LockKey::OutboundRoom(room.clone())).await;

        let mut outbound = self.current_outbound(room, recipients).await?;
        let to_device = self.share_locked(&mut outbound, recipients).await?;

        let message = outbound.session.encrypt(plaintext);
        outbound.message_count += 1;
        self.sessions.save_outbound(&outbound)?;

        debug!(room = %room, session_id = %outbound.session_id(), index = message.message_index(), "encrypted room message");

        Ok(RoomEncryption {
            message: EncryptedRoomMessage {
                algorithm: MEGOLM_ALGORITHM.to_owned(),
                room_id: room.clone(),
                sender_key: self.account.identity_key().to_base64(),
                device_id: self.account.owner().device_id.clone(),
                session_id: outbound.session_id(),
                message_index: message.message_index(),
                ciphertext: message.to_base64(),
            },
            to_device,
        })
    }

    /// Share the room's current key with `devices` that lack it, creating or
    /// rotating the outbound session first if needed.
    pub async fn share_room_key(&self, room: &RoomId, devices: &[DeviceIdentity]) -> Result<Vec<ToDeviceMessage>, GroupError> {
        let _guard = self.locks.acquire(LockKey::OutboundRoom(room.clone())).await;

        let mut outbound = self.current_outbound(room, devices).await?;
        let to_device = self.share_locked(&mut outbound, devices).await?;
        self.sessions.save_outbound(&outbound)?;
        Ok(to_device)
    }

    /// Force rotation before the room's next message.
    pub async fn invalidate_room(&self, room: &RoomId) -> Result<(), GroupError> {
        let _guard = self.locks.acquire(LockKey::OutboundRoom(room.clone())).await;

        if let Some(mut outbound) = self.sessions.outbound(room)? {
            outbound.invalidated = true;
            self.sessions.save_outbound(&outbound)?;
            info!(room = %room, session_id = %outbound.session_id(), "outbound session invalidated");
        }
        Ok(())
    }

    /// Chain index at which `device` received our outbound session
    /// `session_id`, if it did.
    pub fn shared_index(&self, room: &RoomId, session_id: &str, device: &DeviceKey) -> Result<Option<u32>, GroupError> {
        Ok(self
            .sessions
            .outbound(room)?
            .filter(|outbound| outbound.session_id() == session_id)
            .and_then(|outbound| outbound.shared_with.get(device).copied()))
    }

    async fn current_outbound(&self, room: &RoomId, recipients: &[DeviceIdentity]) -> Result<OutboundRoomSession, GroupError> {
        let now = self.env.now_millis();

        if let Some(existing) = self.sessions.outbound(room)? {
            match self.rotation_reason(&existing, recipients, now) {
                None => return Ok(existing),
                Some(reason) => info!(room = %room, session_id = %existing.session_id(), reason, "rotating outbound session"),
            }
        }

        let outbound = OutboundRoomSession {
            room_id: room.clone(),
            session: GroupSession::new(SessionConfig::version_1()),
            created_at: now,
            message_count: 0,
            shared_with: BTreeMap::new(),
            withheld: BTreeSet::new(),
            invalidated: false,
        };

        let own_copy = InboundRoomSession {
            key: InboundGroupKey {
                room_id: room.clone(),
                sender_key: self.account.identity_key().to_base64(),
                session_id: outbound.session_id(),
            },
            session: InboundGroupSession::new(&outbound.session.session_key(), SessionConfig::version_1()),
            forwarded: false,
        };

        {
            let _inbound = self.locks.acquire(LockKey::InboundRoom(room.clone())).await;
            self.sessions
                .store()
                .write(vec![self.sessions.outbound_op(&outbound)?, self.sessions.inbound_op(&own_copy)?])?;
        }

        info!(room = %room, session_id = %outbound.session_id(), "created outbound session");
        Ok(outbound)
    }

    fn rotation_reason(&self, outbound: &OutboundRoomSession, recipients: &[DeviceIdentity], now: u64) -> Option<&'static str> {
        if outbound.invalidated {
            return Some("invalidated");
        }
        if outbound.message_count >= self.config.rotation_period_msgs {
            return Some("message limit");
        }
        if now.saturating_sub(outbound.created_at) >= self.config.rotation_period_ms {
            return Some("age limit");
        }
        let current: BTreeSet<DeviceKey> = recipients.iter().map(DeviceIdentity::key).collect();
        if outbound.shared_with.keys().any(|device| !current.contains(device)) {
            return Some("recipient left");
        }
        None
    }

    async fn share_locked(
        &self,
        outbound: &mut OutboundRoomSession,
        recipients: &[DeviceIdentity],
    ) -> Result<Vec<ToDeviceMessage>, GroupError> {
        let owner = self.account.owner().clone();
        let session_id = outbound.session_id();
        let mut to_device = Vec::new();

        for device in recipients {
            let key = device.key();
            if key == owner || outbound.shared_with.contains_key(&key) {
                continue;
            }
            if device.blocked {
                if outbound.withheld.insert(key.clone()) {
                    debug!(room = %outbound.room_id, device = %key, "withholding key from blocked device");
                    to_device.push(self.withheld(outbound, &session_id, &key, WithheldCode::Blacklisted));
                }
                continue;
            }

            let index = outbound.session.message_index();
            let content = OlmContent::RoomKey(RoomKeyContent {
                algorithm: MEGOLM_ALGORITHM.to_owned(),
                room_id: outbound.room_id.clone(),
                session_id: session_id.clone(),
                session_key: outbound.session.session_key().to_base64(),
            });

            match self.olm.encrypt_content(device, content).await {
                Ok(envelope) => {
                    outbound.withheld.remove(&key);
                    outbound.shared_with.insert(key.clone(), index);
                    debug!(room = %outbound.room_id, device = %key, index, "shared room key");
                    to_device.push(ToDeviceMessage {
                        sender: owner.user_id.clone(),
                        recipient: key,
                        content: ToDeviceContent::Encrypted(envelope),
                    });
                },
                Err(err) if err.is_no_olm() => {
                    warn!(room = %outbound.room_id, device = %key, error = %err, "no pairwise channel, withholding key");
                    if outbound.withheld.insert(key.clone()) {
                        to_device.push(self.withheld(outbound, &session_id, &key, WithheldCode::NoOlm));
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }

        Ok(to_device)
    }

    fn withheld(&self, outbound: &OutboundRoomSession, session_id: &str, device: &DeviceKey, code: WithheldCode) -> ToDeviceMessage {
        ToDeviceMessage {
            sender: self.account.owner().user_id.clone(),
            recipient: device.clone(),
            content: ToDeviceContent::Withheld(WithheldContent {
                code,
                room_id: outbound.room_id.clone(),
                session_id: session_id.to_owned(),
                sender_key: self.account.identity_key().to_base64(),
                algorithm: MEGOLM_ALGORITHM.to_owned(),
                from_device: self.account.owner().device_id.clone(),
                request_id: None,
            }),
        }
    }

    /// Decrypt a room message.
    ///
    /// # Errors
    ///
    /// - `MissingKey` if no inbound session matches
    /// - `UnknownMessageIndex` if the session starts after `message_index`
    /// - `Replay` if this `(session, index)` was decrypted before
    /// - `IntegrityFailure` if the ratchet rejects the ciphertext
    pub async fn decrypt(
        &self,
        room: &RoomId,
        sender_key: &str,
        session_id: &str,
        ciphertext: &str,
        message_index: u32,
    ) -> Result<DecryptedRoomEvent, DecryptionError> {
        let message = MegolmMessage::from_base64(ciphertext)
            .map_err(|e| DecryptionError::MalformedEnvelope { reason: e.to_string() })?;
        if message.message_index() != message_index {
            return Err(DecryptionError::MalformedEnvelope { reason: "message index does not match ciphertext".into() });
        }

        let key = InboundGroupKey { room_id: room.clone(), sender_key: sender_key.to_owned(), session_id: session_id.to_owned() };
        let _guard = self.locks.acquire(LockKey::InboundRoom(room.clone())).await;

        let Some(mut inbound) = self.sessions.inbound(&key)? else {
            debug!(room = %room, session_id, "no inbound session");
            return Err(DecryptionError::MissingKey { room_id: room.clone(), session_id: session_id.to_owned() });
        };

        let first_known = inbound.session.first_known_index();
        if message_index < first_known {
            return Err(DecryptionError::UnknownMessageIndex {
                session_id: session_id.to_owned(),
                first_known,
                requested: message_index,
            });
        }

        let decrypted = inbound
            .session
            .decrypt(&message)
            .map_err(|e| DecryptionError::IntegrityFailure { reason: e.to_string() })?;

        if !self.sessions.mark_decrypted(&key, decrypted.message_index)? {
            warn!(room = %room, session_id, index = decrypted.message_index, "replayed room message");
            return Err(DecryptionError::Replay { session_id: session_id.to_owned(), message_index: decrypted.message_index });
        }

        Ok(DecryptedRoomEvent {
            plaintext: decrypted.plaintext,
            message_index: decrypted.message_index,
            forwarded: inbound.forwarded,
        })
    }

    /// Install a room key received from its creator.
    ///
    /// Returns `true` if it was installed (new or better than what we had).
    pub async fn receive_room_key(&self, sender_key: &str, content: &RoomKeyContent) -> Result<bool, GroupError> {
        if content.algorithm != MEGOLM_ALGORITHM {
            return Err(GroupError::InvalidRoomKey { reason: format!("unsupported algorithm {}", content.algorithm) });
        }
        let session_key = SessionKey::from_base64(&content.session_key)
            .map_err(|e| GroupError::InvalidRoomKey { reason: e.to_string() })?;

        let session = InboundGroupSession::new(&session_key, SessionConfig::version_1());
        self.install(
            InboundRoomSession {
                key: InboundGroupKey {
                    room_id: content.room_id.clone(),
                    sender_key: sender_key.to_owned(),
                    session_id: content.session_id.clone(),
                },
                session,
                forwarded: false,
            },
        )
        .await
    }

    /// Install a key obtained by forwarding or import.
    pub async fn import_forwarded(&self, key: InboundGroupKey, exported: &str) -> Result<bool, GroupError> {
        let exported = ExportedSessionKey::from_base64(exported)
            .map_err(|e| GroupError::InvalidRoomKey { reason: e.to_string() })?;
        let session = InboundGroupSession::import(&exported, SessionConfig::version_1());
        self.install(InboundRoomSession { key, session, forwarded: true }).await
    }

    async fn install(&self, candidate: InboundRoomSession) -> Result<bool, GroupError> {
        if candidate.session.session_id() != candidate.key.session_id {
            return Err(GroupError::InvalidRoomKey { reason: "session id does not match key".into() });
        }

        let _guard = self.locks.acquire(LockKey::InboundRoom(candidate.key.room_id.clone())).await;

        if let Some(existing) = self.sessions.inbound(&candidate.key)? {
            let have = existing.session.first_known_index();
            let offered = candidate.session.first_known_index();
            let upgrade = offered < have || (offered == have && existing.forwarded && !candidate.forwarded);
            if !upgrade {
                debug!(session_id = %candidate.key.session_id, have, offered, "keeping existing inbound session");
                return Ok(false);
            }
        }

        self.sessions.save_inbound(&candidate)?;
        info!(
            room = %candidate.key.room_id,
            session_id = %candidate.key.session_id,
            first_known = candidate.session.first_known_index(),
            forwarded = candidate.forwarded,
            "installed inbound session"
        );
        Ok(true)
    }

    /// Whether an inbound session is held.
    pub fn has_inbound(&self, key: &InboundGroupKey) -> Result<bool, GroupError> {
        Ok(self.sessions.inbound(key)?.is_some())
    }

    /// Export an inbound session from `index`, or from its first known index.
    ///
    /// `None` if the session is not held or starts after `index`.
    pub async fn export_session(&self, key: &InboundGroupKey, index: Option<u32>) -> Result<Option<String>, GroupError> {
        let _guard = self.locks.acquire(LockKey::InboundRoom(key.room_id.clone())).await;

        let Some(mut inbound) = self.sessions.inbound(key)? else {
            return Ok(None);
        };
        let exported = match index {
            Some(index) => inbound.session.export_at(index),
            None => Some(inbound.session.export_at_first_known_index()),
        };
        Ok(exported.map(|key| key.to_base64()))
    }
}
