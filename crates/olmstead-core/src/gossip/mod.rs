//! Room key gossip: request, forward, cancel.
//!
//! # Requester side
//!
//! ```text
//! MissingKey ──► request_missing_key ──► Pending ──┬─► forwarded key ──► Satisfied
//!                                                  ├─► cancel_key_request ──► Cancelled
//!                                                  └─► withheld by every target ──► Ignored
//! ```
//!
//! One request exists per `(room, session)`. Every transition happens under
//! a single async mutex, so a forward racing a cancellation ends in exactly
//! one terminal state.
//!
//! # Responder side
//!
//! Requests from verified devices, or from devices we originally shared the
//! session with, are answered at once. Requests from other known devices are
//! held in the [`IncomingRegistry`] until the user decides or the device is
//! verified. A device re-requesting a held session under a new id replaces
//! its earlier request rather than adding a second one.

mod registry;

use std::sync::Arc;

pub use registry::{Admission, Cancellation, IncomingKeyRequest, IncomingRegistry, IncomingRequestKey};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    account::OwnAccount,
    action::EngineAction,
    env::Environment,
    identity::{DeviceIdentity, IdentityError, IdentityStore, MEGOLM_ALGORITHM},
    ids::{DeviceKey, RoomId, UserId},
    megolm::{GroupError, GroupSessionManager},
    olm::{DecryptedPayload, OlmChannelManager, OlmError},
    session_repository::{InboundGroupKey, OutgoingKeyRequest, RequestState, SessionRepository},
    storage::{StorageError, Store},
    transport::KeyDirectory,
    wire::{GossipAction, GossipMessage, OlmContent, ToDeviceContent, ToDeviceMessage, WithheldCode, WithheldContent},
};

/// Gossip failures. Policy rejections are outcomes, not errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GossipError {
    /// Request state could not be loaded or saved
    #[error(transparent)]
    Store(#[from] StorageError),

    /// Device lookup failed
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Pairwise channel failed
    #[error(transparent)]
    Olm(#[from] OlmError),

    /// Key export or install failed
    #[error(transparent)]
    Group(#[from] GroupError),
}

/// How an incoming request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipOutcome {
    /// Key forwarded
    Shared,
    /// Refused with a withheld notice
    Withheld(WithheldCode),
    /// Waiting for a user decision or verification
    Held,
    /// Dropped without reply (duplicate, echo, unknown device, bad algorithm)
    Ignored,
}

enum Decision {
    Share(Option<u32>),
    Withhold(WithheldCode),
    Hold,
}

/// Runs both sides of the key request protocol.
pub struct KeyGossipCoordinator<S: Store, D: KeyDirectory, E: Environment> {
    account: Arc<OwnAccount<S>>,
    identities: IdentityStore<S>,
    sessions: SessionRepository<S>,
    olm: Arc<OlmChannelManager<S, D, E>>,
    group: Arc<GroupSessionManager<S, D, E>>,
    env: E,
    incoming: IncomingRegistry,
    outgoing: tokio::sync::Mutex<()>,
}

impl<S: Store, D: KeyDirectory, E: Environment> KeyGossipCoordinator<S, D, E> {
    /// Wire up a coordinator.
    pub fn new(
        account: Arc<OwnAccount<S>>,
        identities: IdentityStore<S>,
        sessions: SessionRepository<S>,
        olm: Arc<OlmChannelManager<S, D, E>>,
        group: Arc<GroupSessionManager<S, D, E>>,
        env: E,
    ) -> Self {
        Self {
            account,
            identities,
            sessions,
            olm,
            group,
            env,
            incoming: IncomingRegistry::new(),
            outgoing: tokio::sync::Mutex::new(()),
        }
    }

    // Requester side

    /// Ask our other devices and the sender's devices for a missing key.
    ///
    /// A second call for the same session while a request is satisfied is a
    /// no-op. While it is pending, only devices learned since the request
    /// went out are asked.
    pub async fn request_missing_key(
        &self,
        room: &RoomId,
        sender: &UserId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Vec<EngineAction>, GossipError> {
        let _guard = self.outgoing.lock().await;
        let targets = self.request_targets(sender)?;

        match self.sessions.outgoing_request(room, session_id)? {
            Some(existing) if existing.state == RequestState::Satisfied => {
                debug!(room = %room, session_id, "key already received");
                return Ok(Vec::new());
            },
            Some(mut existing) if existing.state == RequestState::Pending => {
                let added: Vec<DeviceKey> = targets.into_iter().filter(|t| !existing.targets.contains(t)).collect();
                if added.is_empty() {
                    debug!(room = %room, session_id, "key already requested");
                    return Ok(Vec::new());
                }
                existing.targets.extend(added.iter().cloned());
                existing.targets.sort();
                self.sessions.save_outgoing_request(&existing)?;

                info!(room = %room, session_id, request_id = %existing.request_id, added = added.len(), "extending key request");
                let extension = OutgoingKeyRequest { targets: added, ..existing };
                return Ok(self.broadcast(&extension, GossipAction::Request, None));
            },
            _ => {},
        }

        let request = OutgoingKeyRequest {
            request_id: self.env.random_id(16),
            session: InboundGroupKey {
                room_id: room.clone(),
                sender_key: sender_key.to_owned(),
                session_id: session_id.to_owned(),
            },
            targets,
            withheld_by: Vec::new(),
            state: RequestState::Pending,
        };
        self.sessions.save_outgoing_request(&request)?;

        info!(room = %room, session_id, request_id = %request.request_id, targets = request.targets.len(), "requesting room key");
        Ok(self.broadcast(&request, GossipAction::Request, None))
    }

    /// Withdraw our request for a session. Idempotent.
    pub async fn cancel_key_request(&self, room: &RoomId, session_id: &str) -> Result<Vec<EngineAction>, GossipError> {
        let _guard = self.outgoing.lock().await;

        let Some(mut request) = self.sessions.outgoing_request(room, session_id)? else {
            return Ok(Vec::new());
        };
        if request.state.is_terminal() {
            debug!(room = %room, session_id, state = ?request.state, "cancel after terminal state");
            return Ok(Vec::new());
        }

        request.state = RequestState::Cancelled;
        self.sessions.save_outgoing_request(&request)?;
        info!(room = %room, session_id, request_id = %request.request_id, "key request cancelled");

        let mut actions = self.broadcast(&request, GossipAction::RequestCancellation, None);
        actions.push(EngineAction::KeyRequestFinished { session: request.session, state: RequestState::Cancelled });
        Ok(actions)
    }

    /// Install a forwarded key that answers one of our pending requests.
    ///
    /// Forwards for unknown, cancelled or already satisfied requests, or
    /// from devices we did not ask, are dropped.
    pub async fn receive_forwarded_key(
        &self,
        from: &DecryptedPayload,
        forward: &GossipMessage,
    ) -> Result<Vec<EngineAction>, GossipError> {
        let _guard = self.outgoing.lock().await;

        let Some(mut request) = self.sessions.outgoing_request(&forward.room_id, &forward.session_id)? else {
            debug!(session_id = %forward.session_id, "unsolicited forwarded key");
            return Ok(Vec::new());
        };
        if request.state != RequestState::Pending || request.request_id != forward.request_id {
            debug!(session_id = %forward.session_id, state = ?request.state, "forwarded key for inactive request");
            return Ok(Vec::new());
        }
        if request.session.sender_key != forward.sender_key || forward.algorithm != MEGOLM_ALGORITHM {
            warn!(session_id = %forward.session_id, "forwarded key does not match request");
            return Ok(Vec::new());
        }
        let Some(forwarder) = from.sender_device.as_ref().map(DeviceIdentity::key) else {
            warn!(session_id = %forward.session_id, "forwarded key from unknown device");
            return Ok(Vec::new());
        };
        if !request.targets.contains(&forwarder) {
            warn!(session_id = %forward.session_id, from = %forwarder, "forwarded key from device we did not ask");
            return Ok(Vec::new());
        }
        let Some(session_key) = forward.session_key.as_deref() else {
            return Ok(Vec::new());
        };

        let installed = match self.group.import_forwarded(request.session.clone(), session_key).await {
            Ok(installed) => installed,
            Err(GroupError::InvalidRoomKey { reason }) => {
                warn!(session_id = %forward.session_id, %reason, "unusable forwarded key");
                return Ok(Vec::new());
            },
            Err(err) => return Err(err.into()),
        };

        request.state = RequestState::Satisfied;
        self.sessions.save_outgoing_request(&request)?;
        info!(session_id = %forward.session_id, from = %forwarder, installed, "key request satisfied");

        let others = OutgoingKeyRequest {
            targets: request.targets.iter().filter(|t| **t != forwarder).cloned().collect(),
            ..request.clone()
        };
        let mut actions = self.broadcast(&others, GossipAction::RequestCancellation, None);
        if installed {
            actions.push(EngineAction::RoomKeyReceived { session: request.session.clone(), forwarded: true });
        }
        actions.push(EngineAction::KeyRequestFinished { session: request.session, state: RequestState::Satisfied });
        Ok(actions)
    }

    /// A room key arrived through normal sharing; settle any request for it.
    pub async fn on_key_installed(&self, session: &InboundGroupKey) -> Result<Vec<EngineAction>, GossipError> {
        let _guard = self.outgoing.lock().await;

        let Some(mut request) = self.sessions.outgoing_request(&session.room_id, &session.session_id)? else {
            return Ok(Vec::new());
        };
        if request.state != RequestState::Pending {
            return Ok(Vec::new());
        }

        request.state = RequestState::Satisfied;
        self.sessions.save_outgoing_request(&request)?;
        debug!(session_id = %session.session_id, "key request satisfied by room key");

        let mut actions = self.broadcast(&request, GossipAction::RequestCancellation, None);
        actions.push(EngineAction::KeyRequestFinished { session: request.session, state: RequestState::Satisfied });
        Ok(actions)
    }

    /// Record a withheld answer; once every target refused, the request is
    /// Ignored.
    pub async fn receive_withheld(&self, sender: &UserId, withheld: &WithheldContent) -> Result<Vec<EngineAction>, GossipError> {
        let _guard = self.outgoing.lock().await;

        let Some(mut request) = self.sessions.outgoing_request(&withheld.room_id, &withheld.session_id)? else {
            return Ok(Vec::new());
        };
        if request.state != RequestState::Pending {
            return Ok(Vec::new());
        }
        if let Some(id) = &withheld.request_id
            && id != &request.request_id
        {
            return Ok(Vec::new());
        }

        let from = DeviceKey::new(sender.clone(), withheld.from_device.clone());
        if !request.targets.contains(&from) || request.withheld_by.contains(&from) {
            return Ok(Vec::new());
        }
        request.withheld_by.push(from.clone());
        debug!(session_id = %withheld.session_id, from = %from, code = ?withheld.code, "key withheld");

        let mut actions = Vec::new();
        if request.withheld_by.len() >= request.targets.len() {
            request.state = RequestState::Ignored;
            info!(session_id = %withheld.session_id, "every target withheld the key");
            actions.push(EngineAction::KeyRequestFinished { session: request.session.clone(), state: RequestState::Ignored });
        }
        self.sessions.save_outgoing_request(&request)?;
        Ok(actions)
    }

    /// Our other devices plus the sender's devices, sorted.
    fn request_targets(&self, sender: &UserId) -> Result<Vec<DeviceKey>, GossipError> {
        let owner = self.account.owner();
        let mut targets: Vec<DeviceKey> = self
            .identities
            .user_devices(&owner.user_id)?
            .into_iter()
            .chain(if sender == &owner.user_id { Vec::new() } else { self.identities.user_devices(sender)? })
            .map(|device| device.key())
            .filter(|device| device != owner)
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    fn broadcast(&self, request: &OutgoingKeyRequest, action: GossipAction, session_key: Option<String>) -> Vec<EngineAction> {
        let owner = self.account.owner();
        request
            .targets
            .iter()
            .map(|target| {
                EngineAction::SendToDevice(ToDeviceMessage {
                    sender: owner.user_id.clone(),
                    recipient: target.clone(),
                    content: ToDeviceContent::KeyRequest(GossipMessage {
                        action,
                        requesting_device_id: owner.device_id.clone(),
                        request_id: request.request_id.clone(),
                        room_id: request.session.room_id.clone(),
                        session_id: request.session.session_id.clone(),
                        sender_key: request.session.sender_key.clone(),
                        algorithm: MEGOLM_ALGORITHM.to_owned(),
                        session_key: session_key.clone(),
                    }),
                })
            })
            .collect()
    }

    // Responder side

    /// Handle a plaintext request or cancellation from `sender`.
    pub async fn handle_key_request(
        &self,
        sender: &UserId,
        message: &GossipMessage,
    ) -> Result<(GossipOutcome, Vec<EngineAction>), GossipError> {
        match message.action {
            GossipAction::Request => self.handle_incoming_request(sender, message).await,
            GossipAction::RequestCancellation => Ok((GossipOutcome::Ignored, self.handle_cancellation(sender, message)?)),
            GossipAction::ForwardedKey => {
                warn!(from = %sender, "forwarded key sent in plaintext, dropping");
                Ok((GossipOutcome::Ignored, Vec::new()))
            },
        }
    }

    async fn handle_incoming_request(
        &self,
        sender: &UserId,
        message: &GossipMessage,
    ) -> Result<(GossipOutcome, Vec<EngineAction>), GossipError> {
        let requester = DeviceKey::new(sender.clone(), message.requesting_device_id.clone());
        let key = IncomingRequestKey { requester: requester.clone(), request_id: message.request_id.clone() };

        if message.algorithm != MEGOLM_ALGORITHM {
            debug!(from = %requester, algorithm = %message.algorithm, "key request for unsupported algorithm");
            return Ok((GossipOutcome::Ignored, Vec::new()));
        }
        if &requester == self.account.owner() {
            return Ok((GossipOutcome::Ignored, Vec::new()));
        }
        if self.incoming.is_known(&key) {
            debug!(from = %requester, request_id = %message.request_id, "duplicate key request");
            return Ok((GossipOutcome::Ignored, Vec::new()));
        }
        let Some(device) = self.identities.device(&requester)? else {
            debug!(from = %requester, "key request from unknown device");
            return Ok((GossipOutcome::Ignored, Vec::new()));
        };

        let request = IncomingKeyRequest {
            requester: requester.clone(),
            request_id: message.request_id.clone(),
            session: InboundGroupKey {
                room_id: message.room_id.clone(),
                sender_key: message.sender_key.clone(),
                session_id: message.session_id.clone(),
            },
            algorithm: message.algorithm.clone(),
            state: RequestState::Pending,
        };

        match self.decide(&device, &request.session)? {
            Decision::Hold => match self.incoming.hold(request) {
                Admission::FirstForDevice => {
                    info!(from = %requester, "holding key request for user decision");
                    let requests = self.incoming.pending_for(&requester);
                    Ok((GossipOutcome::Held, vec![EngineAction::PromptShareDecision { device: requester, requests }]))
                },
                Admission::Coalesced => Ok((GossipOutcome::Held, Vec::new())),
                Admission::Superseded => {
                    debug!(from = %requester, request_id = %message.request_id, "re-request replaced pending request");
                    Ok((GossipOutcome::Held, Vec::new()))
                },
                Admission::Duplicate => Ok((GossipOutcome::Ignored, Vec::new())),
            },
            Decision::Withhold(code) => {
                self.incoming.finish(key);
                Ok((GossipOutcome::Withheld(code), vec![self.withheld_reply(&request, code)]))
            },
            Decision::Share(index) => {
                self.incoming.finish(key);
                let (outcome, action) = self.share(&device, &request, index).await?;
                Ok((outcome, vec![action]))
            },
        }
    }

    fn decide(&self, device: &DeviceIdentity, session: &InboundGroupKey) -> Result<Decision, GossipError> {
        if !self.group.has_inbound(session)? {
            return Ok(Decision::Withhold(WithheldCode::Unavailable));
        }
        if device.blocked {
            return Ok(Decision::Withhold(WithheldCode::Blacklisted));
        }
        if session.sender_key == self.account.identity_key().to_base64()
            && let Some(index) = self.group.shared_index(&session.room_id, &session.session_id, &device.key())?
        {
            return Ok(Decision::Share(Some(index)));
        }
        if device.is_verified() {
            return Ok(Decision::Share(None));
        }
        Ok(Decision::Hold)
    }

    async fn share(
        &self,
        device: &DeviceIdentity,
        request: &IncomingKeyRequest,
        index: Option<u32>,
    ) -> Result<(GossipOutcome, EngineAction), GossipError> {
        let Some(exported) = self.group.export_session(&request.session, index).await? else {
            return Ok((GossipOutcome::Withheld(WithheldCode::Unavailable), self.withheld_reply(request, WithheldCode::Unavailable)));
        };

        let forward = GossipMessage {
            action: GossipAction::ForwardedKey,
            requesting_device_id: request.requester.device_id.clone(),
            request_id: request.request_id.clone(),
            room_id: request.session.room_id.clone(),
            session_id: request.session.session_id.clone(),
            sender_key: request.session.sender_key.clone(),
            algorithm: request.algorithm.clone(),
            session_key: Some(exported),
        };

        match self.olm.encrypt_content(device, OlmContent::ForwardedRoomKey(forward)).await {
            Ok(envelope) => {
                info!(to = %request.requester, session_id = %request.session.session_id, ?index, "forwarded room key");
                Ok((
                    GossipOutcome::Shared,
                    EngineAction::SendToDevice(ToDeviceMessage {
                        sender: self.account.owner().user_id.clone(),
                        recipient: request.requester.clone(),
                        content: ToDeviceContent::Encrypted(envelope),
                    }),
                ))
            },
            Err(err) if err.is_no_olm() => {
                warn!(to = %request.requester, error = %err, "no pairwise channel for forward");
                Ok((GossipOutcome::Withheld(WithheldCode::NoOlm), self.withheld_reply(request, WithheldCode::NoOlm)))
            },
            Err(err) => Err(err.into()),
        }
    }

    fn withheld_reply(&self, request: &IncomingKeyRequest, code: WithheldCode) -> EngineAction {
        debug!(to = %request.requester, ?code, session_id = %request.session.session_id, "withholding requested key");
        EngineAction::SendToDevice(ToDeviceMessage {
            sender: self.account.owner().user_id.clone(),
            recipient: request.requester.clone(),
            content: ToDeviceContent::Withheld(WithheldContent {
                code,
                room_id: request.session.room_id.clone(),
                session_id: request.session.session_id.clone(),
                sender_key: request.session.sender_key.clone(),
                algorithm: request.algorithm.clone(),
                from_device: self.account.owner().device_id.clone(),
                request_id: Some(request.request_id.clone()),
            }),
        })
    }

    fn handle_cancellation(&self, sender: &UserId, message: &GossipMessage) -> Result<Vec<EngineAction>, GossipError> {
        let requester = DeviceKey::new(sender.clone(), message.requesting_device_id.clone());
        if self.identities.device(&requester)?.is_none() {
            debug!(from = %requester, "cancellation from unknown device");
            return Ok(Vec::new());
        }
        let key = IncomingRequestKey { requester: requester.clone(), request_id: message.request_id.clone() };

        Ok(match self.incoming.cancel(&key) {
            Cancellation::LastForDevice => {
                debug!(from = %requester, request_id = %message.request_id, "pending request cancelled");
                vec![EngineAction::PromptDismissed { device: requester }]
            },
            Cancellation::Removed => Vec::new(),
            Cancellation::Tombstoned => {
                debug!(from = %requester, request_id = %message.request_id, "cancellation before request");
                Vec::new()
            },
            Cancellation::AlreadyFinished => Vec::new(),
        })
    }

    /// Apply the user's decision to every pending request of `device`.
    ///
    /// Each request is answered on its own. One that fails stays pending and
    /// the prompt is raised again, so a later decision can retry it.
    pub async fn resolve_share_decision(&self, device: &DeviceKey, share: bool) -> Result<Vec<EngineAction>, GossipError> {
        let identity = if share { self.identities.device(device)? } else { None };
        let requests = self.incoming.take(device);
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut actions = Vec::with_capacity(requests.len() + 1);
        for request in requests {
            match self.answer(identity.as_ref(), &request).await {
                Ok(action) => {
                    self.incoming.finish(request.key());
                    actions.push(action);
                },
                Err(err) => {
                    warn!(device = %device, request_id = %request.request_id, error = %err, "could not answer key request");
                    self.incoming.hold(request);
                },
            }
        }

        let remaining = self.incoming.pending_for(device);
        info!(device = %device, share, answered = actions.len(), retry = remaining.len(), "resolved share decision");
        if remaining.is_empty() {
            actions.push(EngineAction::PromptDismissed { device: device.clone() });
        } else {
            actions.push(EngineAction::PromptShareDecision { device: device.clone(), requests: remaining });
        }
        Ok(actions)
    }

    /// Reply to one released request: the key, or a withheld notice.
    ///
    /// `identity` is `None` when the user declined or the device is gone.
    async fn answer(&self, identity: Option<&DeviceIdentity>, request: &IncomingKeyRequest) -> Result<EngineAction, GossipError> {
        let Some(identity) = identity else {
            return Ok(self.withheld_reply(request, WithheldCode::Unauthorised));
        };
        if !self.group.has_inbound(&request.session)? {
            return Ok(self.withheld_reply(request, WithheldCode::Unavailable));
        }
        if identity.blocked {
            return Ok(self.withheld_reply(request, WithheldCode::Blacklisted));
        }
        let index = if request.session.sender_key == self.account.identity_key().to_base64() {
            self.group.shared_index(&request.session.room_id, &request.session.session_id, &request.requester)?
        } else {
            None
        };
        Ok(self.share(identity, request, index).await?.1)
    }

    /// A device finished verification: release every request it had pending.
    pub async fn on_device_verified(&self, device: &DeviceKey) -> Result<Vec<EngineAction>, GossipError> {
        self.resolve_share_decision(device, true).await
    }

    /// Requests awaiting a decision for `device`.
    pub fn pending_decisions(&self, device: &DeviceKey) -> Vec<IncomingKeyRequest> {
        self.incoming.pending_for(device)
    }

    /// Tear down the per-process registry (logout).
    pub fn clear(&self) {
        self.incoming.clear();
    }
}
