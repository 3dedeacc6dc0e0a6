//! Pairwise (Olm) channels.
//!
//! One remote device may have several sessions with us. Exactly one is
//! current: the one with the greatest `last_used_at`. Encryption always uses
//! it; decryption tries the session named in the envelope first and then
//! every other session, newest first.
//!
//! # Invariants
//!
//! - Every encrypt, decrypt and handshake for one remote identity key runs
//!   under that key's lock
//! - `last_used_at` strictly increases per remote device
//! - A failing receiver never mutates its existing ratchets; recovery always
//!   means opening a new session
//!
//! # Unwedging
//!
//! ```text
//!  Bob (receiver)                                  Alice (sender)
//!  decrypt fails on known session S  ──► wedged
//!  unwedge_devices():
//!    claim Alice's one-time key, new session S'
//!    m.room.encrypted { m.dummy } over S'   ──────► new inbound S', now current
//!    session_stale { S }                    ──────► S is hers: next encrypt
//!                                                   to Bob runs a handshake
//! ```

mod error;
mod wedge;

use std::sync::Arc;

pub use error::{HandshakeError, OlmError};
use olmstead_crypto::encoding;
use tracing::{debug, info, warn};
use vodozemac::{
    Curve25519PublicKey,
    olm::{OlmMessage, Session},
};
pub use wedge::WedgeTracker;

use crate::{
    account::{InboundSessionError, OwnAccount},
    config::EngineConfig,
    env::Environment,
    error::DecryptionError,
    identity::{DeviceIdentity, IdentityStore, OLM_ALGORITHM},
    ids::UserId,
    locks::{LockArbiter, LockKey},
    retry::with_backoff,
    session_repository::{PairwiseSession, SessionRepository, next_stamp},
    storage::Store,
    transport::{ClaimedOneTimeKey, KeyDirectory},
    wire::{OlmContent, OlmEnvelope, OlmPayload, StaleSessionNotice, ToDeviceContent, ToDeviceMessage},
};

/// A decrypted and identity-checked Olm payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPayload {
    /// Sender's Curve25519 identity key
    pub sender_key: Curve25519PublicKey,
    /// Sender's device, when its keys have been downloaded
    pub sender_device: Option<DeviceIdentity>,
    /// The payload
    pub payload: OlmPayload,
}

/// Creates, selects and repairs pairwise sessions.
pub struct OlmChannelManager<S: Store, D: KeyDirectory, E: Environment> {
    account: Arc<OwnAccount<S>>,
    identities: IdentityStore<S>,
    sessions: SessionRepository<S>,
    directory: D,
    env: E,
    locks: Arc<dyn LockArbiter>,
    config: EngineConfig,
    wedges: WedgeTracker,
}

impl<S: Store, D: KeyDirectory, E: Environment> OlmChannelManager<S, D, E> {
    /// Wire up a manager.
    pub fn new(
        account: Arc<OwnAccount<S>>,
        identities: IdentityStore<S>,
        sessions: SessionRepository<S>,
        directory: D,
        env: E,
        locks: Arc<dyn LockArbiter>,
        config: EngineConfig,
    ) -> Self {
        Self { account, identities, sessions, directory, env, locks, config, wedges: WedgeTracker::new() }
    }

    /// Encrypt raw bytes for `device` over its current session.
    ///
    /// Runs a handshake first when no session exists or a peer asked for a
    /// fresh one.
    ///
    /// # Errors
    ///
    /// - `Handshake` if no session exists and none can be established
    /// - `Store` if session state cannot be loaded or saved
    pub async fn encrypt_to(&self, device: &DeviceIdentity, plaintext: &[u8]) -> Result<OlmEnvelope, OlmError> {
        self.encrypt_with(device, plaintext, false).await
    }

    /// Encrypt an event for `device`, bound to both identities.
    pub async fn encrypt_content(&self, device: &DeviceIdentity, content: OlmContent) -> Result<OlmEnvelope, OlmError> {
        let plaintext = self.payload_bytes(device, content);
        self.encrypt_to(device, &plaintext).await
    }

    /// Open a brand-new session to `device` and send it an `m.dummy`.
    ///
    /// The new session becomes current on both sides once delivered.
    pub async fn force_new_session(&self, device: &DeviceIdentity) -> Result<OlmEnvelope, OlmError> {
        let plaintext = self.payload_bytes(device, OlmContent::Dummy);
        self.encrypt_with(device, &plaintext, true).await
    }

    #[allow(clippy::expect_used)]
    fn payload_bytes(&self, device: &DeviceIdentity, content: OlmContent) -> Vec<u8> {
        let payload = OlmPayload {
            sender: self.account.owner().user_id.clone(),
            sender_device: self.account.owner().device_id.clone(),
            sender_signing_key: self.account.signing_key().to_base64(),
            recipient: device.user_id.clone(),
            recipient_signing_key: device.signing_key.to_base64(),
            content,
        };
        serde_json::to_vec(&payload).expect("invariant: payload has only string keys and serializable fields")
    }

    #[allow(clippy::expect_used)]
    async fn encrypt_with(&self, device: &DeviceIdentity, plaintext: &[u8], force: bool) -> Result<OlmEnvelope, OlmError> {
        let identity_key = device.identity_key.to_base64();
        let _guard = self.locks.acquire(LockKey::Device(identity_key.clone())).await;

        let refresh = force || self.wedges.refresh_pending(&identity_key);
        let mut sessions = self.sessions.pairwise_sessions(&identity_key)?;

        if refresh || sessions.is_empty() {
            let session = self.handshake(device).await?;
            let now = self.env.now_millis();
            info!(device = %device.key(), session_id = %session.session_id(), refresh, "opened pairwise session");
            sessions.insert(0, PairwiseSession {
                session_id: session.session_id(),
                created_at: now,
                last_used_at: 0,
                session,
            });
        }

        let stamp = next_stamp(&sessions, self.env.now_millis());
        let current = sessions.first_mut().expect("invariant: a session was just created when none existed");

        let message = current.session.encrypt(plaintext);
        current.last_used_at = stamp;
        self.sessions.save_pairwise(&identity_key, current)?;
        if refresh {
            self.wedges.refreshed(&identity_key);
        }

        let (message_type, body) = message.to_parts();
        debug!(device = %device.key(), session_id = %current.session_id, message_type, "encrypted pairwise message");

        Ok(OlmEnvelope {
            algorithm: OLM_ALGORITHM.to_owned(),
            sender_key: self.account.identity_key().to_base64(),
            recipient_key: identity_key,
            session_id: current.session_id.clone(),
            message_type,
            body: encoding::encode(body),
        })
    }

    async fn handshake(&self, device: &DeviceIdentity) -> Result<Session, HandshakeError> {
        let device_key = device.key();
        let directory = &self.directory;
        let target = &device_key;

        let claimed: ClaimedOneTimeKey = with_backoff(&self.env, &self.config.retry, "claim_one_time_key", move || async move {
            match directory.claim_one_time_key(target).await {
                Ok(Some(claimed)) => Ok(claimed),
                Ok(None) => Err(HandshakeError::NoOneTimeKey { device: target.clone() }),
                Err(err) => Err(HandshakeError::Transport(err)),
            }
        })
        .await?;

        if !claimed.key.verify(&device_key, &device.signing_key) {
            warn!(device = %device_key, key_id = %claimed.key_id, "claimed one-time key has a bad signature");
            return Err(HandshakeError::InvalidOneTimeKeySignature { device: device_key });
        }
        let Some(one_time_key) = claimed.key.curve25519() else {
            return Err(HandshakeError::InvalidOneTimeKeySignature { device: device_key });
        };

        Ok(self.account.create_outbound_session(device.identity_key, one_time_key))
    }

    /// Decrypt a pairwise message from `sender_key`.
    ///
    /// # Errors
    ///
    /// - `MalformedEnvelope` if the envelope cannot be parsed or is not for us
    /// - `IntegrityFailure` if the named session exists but rejects the
    ///   message; the sender is then marked wedged
    /// - `NoMatchingSession` if no session decrypts it and it cannot start one
    pub async fn decrypt_from(
        &self,
        sender_key: &Curve25519PublicKey,
        envelope: &OlmEnvelope,
    ) -> Result<Vec<u8>, DecryptionError> {
        if envelope.algorithm != OLM_ALGORITHM {
            return Err(DecryptionError::MalformedEnvelope { reason: format!("unsupported algorithm {}", envelope.algorithm) });
        }
        if envelope.recipient_key != self.account.identity_key().to_base64() {
            return Err(DecryptionError::MalformedEnvelope { reason: "addressed to another identity key".into() });
        }
        let body = encoding::decode(&envelope.body)
            .map_err(|e| DecryptionError::MalformedEnvelope { reason: format!("body is not base64: {e}") })?;
        let message = OlmMessage::from_parts(envelope.message_type, &body)
            .map_err(|e| DecryptionError::MalformedEnvelope { reason: e.to_string() })?;
        if let OlmMessage::PreKey(pre_key) = &message
            && pre_key.session_id() != envelope.session_id
        {
            return Err(DecryptionError::MalformedEnvelope { reason: "session id does not match pre-key message".into() });
        }

        let identity_key = sender_key.to_base64();
        let _guard = self.locks.acquire(LockKey::Device(identity_key.clone())).await;

        let mut sessions = self.sessions.pairwise_sessions(&identity_key)?;
        let mut order: Vec<usize> = (0..sessions.len()).collect();
        order.sort_by_key(|&i| sessions[i].session_id != envelope.session_id);

        let mut named_failure = None;
        for index in order {
            match sessions[index].session.decrypt(&message) {
                Ok(plaintext) => {
                    let stamp = next_stamp(&sessions, self.env.now_millis());
                    let session = &mut sessions[index];
                    session.last_used_at = stamp;
                    self.sessions.save_pairwise(&identity_key, session)?;
                    debug!(sender = %identity_key, session_id = %session.session_id, "decrypted pairwise message");
                    return Ok(plaintext);
                },
                Err(err) if sessions[index].session_id == envelope.session_id => {
                    named_failure = Some(err.to_string());
                },
                Err(_) => {},
            }
        }

        if let OlmMessage::PreKey(pre_key) = &message
            && named_failure.is_none()
        {
            return self.create_inbound(sender_key, &identity_key, pre_key, &sessions);
        }

        if let Some(reason) = named_failure {
            let wedged = self.wedges.record_failure(&identity_key, &envelope.session_id, self.config.wedge_failure_threshold);
            warn!(sender = %identity_key, session_id = %envelope.session_id, wedged, %reason, "pairwise integrity failure");
            return Err(DecryptionError::IntegrityFailure { reason });
        }

        Err(DecryptionError::NoMatchingSession { sender_key: identity_key })
    }

    fn create_inbound(
        &self,
        sender_key: &Curve25519PublicKey,
        identity_key: &str,
        pre_key: &vodozemac::olm::PreKeyMessage,
        existing: &[PairwiseSession],
    ) -> Result<Vec<u8>, DecryptionError> {
        let (result, account_op) = self.account.create_inbound_session(*sender_key, pre_key).map_err(|err| match err {
            InboundSessionError::Creation(e) => DecryptionError::IntegrityFailure { reason: e.to_string() },
            InboundSessionError::Identity(e) => DecryptionError::MalformedEnvelope { reason: e.to_string() },
        })?;

        let now = self.env.now_millis();
        let session = PairwiseSession {
            session_id: result.session.session_id(),
            created_at: now,
            last_used_at: next_stamp(existing, now),
            session: result.session,
        };
        let session_op = self.sessions.pairwise_op(identity_key, &session)?;
        self.sessions.store().write(vec![account_op, session_op])?;

        info!(sender = %identity_key, session_id = %session.session_id, "created inbound pairwise session");
        Ok(result.plaintext)
    }

    /// Decrypt and parse a payload, checking it is bound to us and to the
    /// device that owns the sender key.
    pub async fn decrypt_payload(&self, envelope: &OlmEnvelope) -> Result<DecryptedPayload, OlmError> {
        let sender_key = Curve25519PublicKey::from_base64(&envelope.sender_key)
            .map_err(|e| DecryptionError::MalformedEnvelope { reason: e.to_string() })?;
        let plaintext = self.decrypt_from(&sender_key, envelope).await?;

        let payload: OlmPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| DecryptionError::MalformedEnvelope { reason: e.to_string() })?;

        let owner = self.account.owner();
        if payload.recipient != owner.user_id
            || payload.recipient_signing_key != self.account.signing_key().to_base64()
        {
            warn!(sender = %envelope.sender_key, "payload bound to another recipient");
            return Err(DecryptionError::IntegrityFailure { reason: "payload bound to another recipient".into() }.into());
        }

        let sender_device = self.identities.device_by_identity_key(&sender_key)?;
        if let Some(device) = &sender_device
            && (device.user_id != payload.sender
                || device.device_id != payload.sender_device
                || device.signing_key.to_base64() != payload.sender_signing_key)
        {
            warn!(sender = %envelope.sender_key, claimed = %payload.sender, "payload sender does not own the identity key");
            return Err(DecryptionError::IntegrityFailure { reason: "sender identity mismatch".into() }.into());
        }

        Ok(DecryptedPayload { sender_key, sender_device, payload })
    }

    /// Open fresh sessions to every wedged device whose rate limit allows it.
    ///
    /// Returns the encrypted `m.dummy` and the plaintext stale-session notice
    /// for each repaired device. Devices whose handshake fails stay wedged.
    pub async fn unwedge_devices(&self) -> Result<Vec<ToDeviceMessage>, OlmError> {
        let now = self.env.now_millis();
        let due = self.wedges.due(now, self.config.wedge_rate_limit_ms, self.config.wedge_failure_threshold);
        let own_key = self.account.identity_key().to_base64();
        let sender = self.account.owner().user_id.clone();
        let mut messages = Vec::new();

        for (identity_key, session_id) in due {
            let device = match Curve25519PublicKey::from_base64(&identity_key) {
                Ok(key) => self.identities.device_by_identity_key(&key)?,
                Err(_) => None,
            };
            let Some(device) = device else {
                debug!(sender = %identity_key, "wedged device unknown, dropping");
                self.wedges.forget(&identity_key);
                continue;
            };

            match self.force_new_session(&device).await {
                Ok(envelope) => {
                    self.wedges.resolved(&identity_key, now);
                    info!(device = %device.key(), broken_session = %session_id, "unwedged device");
                    messages.push(ToDeviceMessage {
                        sender: sender.clone(),
                        recipient: device.key(),
                        content: ToDeviceContent::Encrypted(envelope),
                    });
                    messages.push(ToDeviceMessage {
                        sender: sender.clone(),
                        recipient: device.key(),
                        content: ToDeviceContent::SessionStale(StaleSessionNotice {
                            sender_key: own_key.clone(),
                            session_id,
                        }),
                    });
                },
                Err(err) => warn!(device = %device.key(), error = %err, "could not unwedge device"),
            }
        }

        Ok(messages)
    }

    /// React to a peer reporting one of our sessions as broken.
    ///
    /// Returns `true` if the next encrypt to that device will open a fresh
    /// session. Notices from devices we do not know are ignored, as are
    /// notices for sessions we never had or that a newer session has
    /// already replaced. Refreshes are rate limited per device.
    pub fn handle_stale_notice(&self, sender: &UserId, notice: &StaleSessionNotice) -> Result<bool, OlmError> {
        let Ok(key) = Curve25519PublicKey::from_base64(&notice.sender_key) else {
            return Ok(false);
        };
        let Some(device) = self.identities.device_by_identity_key(&key)? else {
            debug!(sender_key = %notice.sender_key, "stale notice from unknown device");
            return Ok(false);
        };
        if &device.user_id != sender {
            warn!(claimed = %sender, owner = %device.user_id, "stale notice names another user's key");
            return Ok(false);
        }

        let identity_key = key.to_base64();
        let sessions = self.sessions.pairwise_sessions(&identity_key)?;
        if !sessions.iter().any(|s| s.session_id == notice.session_id) {
            debug!(device = %device.key(), session_id = %notice.session_id, "stale notice for unknown session");
            return Ok(false);
        }
        // The peer's repair handshake already replaced the reported session.
        if sessions.first().is_some_and(|current| current.session_id != notice.session_id) {
            debug!(device = %device.key(), session_id = %notice.session_id, "stale session already superseded");
            return Ok(false);
        }

        let requested = self.wedges.request_refresh(&identity_key, self.env.now_millis(), self.config.wedge_rate_limit_ms);
        info!(device = %device.key(), session_id = %notice.session_id, requested, "peer reported stale session");
        Ok(requested)
    }

    /// Current session id for a device, if any.
    pub fn current_session_id(&self, identity_key: &Curve25519PublicKey) -> Result<Option<String>, OlmError> {
        Ok(self.sessions.pairwise_sessions(&identity_key.to_base64())?.into_iter().next().map(|s| s.session_id))
    }

    /// Identity keys of devices currently marked wedged.
    pub fn wedged_devices(&self) -> Vec<String> {
        self.wedges.wedged()
    }

    /// Forget wedge state (logout).
    pub fn clear(&self) {
        self.wedges.clear();
    }
}
