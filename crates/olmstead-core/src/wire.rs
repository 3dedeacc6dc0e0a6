//! JSON wire formats exchanged with other devices.
//!
//! To-device content is a serde-tagged enum so a message can never be
//! misread as a different event type. Olm payloads are bound to sender and
//! recipient identities; group ciphertexts carry everything the receiver
//! needs to locate the inbound ratchet.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, DeviceKey, RoomId, UserId};

/// Pairwise-encrypted message as it travels between devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmEnvelope {
    /// Always [`crate::identity::OLM_ALGORITHM`]
    pub algorithm: String,
    /// Sender's Curve25519 identity key (base64)
    pub sender_key: String,
    /// Recipient's Curve25519 identity key (base64)
    pub recipient_key: String,
    /// Id of the session the sender encrypted with
    pub session_id: String,
    /// 0 for pre-key messages, 1 for normal messages
    #[serde(rename = "type")]
    pub message_type: usize,
    /// Base64 ratchet message
    pub body: String,
}

impl OlmEnvelope {
    /// Pre-key messages can create new inbound sessions.
    pub fn is_pre_key(&self) -> bool {
        self.message_type == 0
    }
}

/// Plaintext inside an [`OlmEnvelope`].
///
/// The identity fields bind the ciphertext to one sender and one recipient
/// device, so it cannot be replayed to someone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmPayload {
    /// Sending user
    pub sender: UserId,
    /// Sending device
    pub sender_device: DeviceId,
    /// Sender's Ed25519 signing key (base64)
    pub sender_signing_key: String,
    /// Intended recipient user
    pub recipient: UserId,
    /// Intended recipient's Ed25519 signing key (base64)
    pub recipient_signing_key: String,
    /// The event
    pub content: OlmContent,
}

/// Events that only travel encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum OlmContent {
    /// Outbound group session key from its creator
    #[serde(rename = "m.room_key")]
    RoomKey(RoomKeyContent),
    /// Group session key forwarded in answer to a request
    #[serde(rename = "m.forwarded_room_key")]
    ForwardedRoomKey(GossipMessage),
    /// Empty message that establishes a fresh session
    #[serde(rename = "m.dummy")]
    Dummy,
}

/// Group session key shared by its creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// Always [`crate::identity::MEGOLM_ALGORITHM`]
    pub algorithm: String,
    /// Room the session encrypts
    pub room_id: RoomId,
    /// Group session id
    pub session_id: String,
    /// Base64 session key at the index it is shared from
    pub session_key: String,
}

/// What a gossip message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GossipAction {
    /// Ask for a room key
    Request,
    /// Withdraw an earlier request
    RequestCancellation,
    /// Answer carrying the key
    ForwardedKey,
}

/// Room key request, cancellation or forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Message kind
    pub action: GossipAction,
    /// Device that asked
    pub requesting_device_id: DeviceId,
    /// Id shared by the request, its cancellation and its answer
    pub request_id: String,
    /// Room of the wanted session
    pub room_id: RoomId,
    /// Wanted group session id
    pub session_id: String,
    /// Curve25519 key of the session's creator (base64)
    pub sender_key: String,
    /// Group algorithm of the wanted session
    pub algorithm: String,
    /// Exported session key; forwards only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Reason a room key was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WithheldCode {
    /// Recipient device is blocked
    #[serde(rename = "m.blacklisted")]
    Blacklisted,
    /// Recipient device is not verified
    #[serde(rename = "m.unverified")]
    Unverified,
    /// Owner declined to share
    #[serde(rename = "m.unauthorised")]
    Unauthorised,
    /// We do not hold the session
    #[serde(rename = "m.unavailable")]
    Unavailable,
    /// No pairwise channel could be established
    #[serde(rename = "m.no_olm")]
    NoOlm,
}

/// Notice that a room key will not arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithheldContent {
    /// Why
    pub code: WithheldCode,
    /// Room of the session
    pub room_id: RoomId,
    /// Group session id
    pub session_id: String,
    /// Curve25519 key of the session's creator (base64)
    pub sender_key: String,
    /// Group algorithm
    pub algorithm: String,
    /// Device sending the notice
    pub from_device: DeviceId,
    /// Request this answers, when it answers one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Plaintext notice that a pairwise session stopped decrypting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleSessionNotice {
    /// Curve25519 key of the device that saw the failure (base64)
    pub sender_key: String,
    /// Session that failed
    pub session_id: String,
}

/// Every to-device event the engine sends or consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum ToDeviceContent {
    /// Pairwise-encrypted payload
    #[serde(rename = "m.room.encrypted")]
    Encrypted(OlmEnvelope),
    /// Plaintext key request or cancellation
    #[serde(rename = "m.room_key_request")]
    KeyRequest(GossipMessage),
    /// Room key will not be sent
    #[serde(rename = "m.room_key.withheld")]
    Withheld(WithheldContent),
    /// Pairwise session needs replacing
    #[serde(rename = "org.olmstead.session_stale")]
    SessionStale(StaleSessionNotice),
}

/// One to-device event addressed to a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToDeviceMessage {
    /// Sending user, as authenticated by the transport
    pub sender: UserId,
    /// Target device
    pub recipient: DeviceKey,
    /// Event body
    pub content: ToDeviceContent,
}

/// Group-encrypted room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRoomMessage {
    /// Always [`crate::identity::MEGOLM_ALGORITHM`]
    pub algorithm: String,
    /// Room
    pub room_id: RoomId,
    /// Sender's Curve25519 identity key (base64)
    pub sender_key: String,
    /// Sending device
    pub device_id: DeviceId,
    /// Group session id
    pub session_id: String,
    /// Chain index of this message
    pub message_index: u32,
    /// Base64 group ratchet message
    pub ciphertext: String,
}

/// Room key entry in an export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// Group algorithm
    pub algorithm: String,
    /// Room
    pub room_id: RoomId,
    /// Creator's Curve25519 identity key (base64)
    pub sender_key: String,
    /// Group session id
    pub session_id: String,
    /// Exported session key at its first known index
    pub session_key: String,
    /// Creator's claimed Ed25519 key, when known
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
}
