//! Effects the engine asks its embedder to carry out.

use crate::{
    gossip::IncomingKeyRequest,
    ids::DeviceKey,
    session_repository::{InboundGroupKey, RequestState},
    wire::ToDeviceMessage,
};

/// Output of engine operations.
///
/// The engine performs no I/O towards other devices or the UI; callers
/// execute these in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Deliver a to-device event
    SendToDevice(ToDeviceMessage),

    /// Ask the user whether to share keys with an unverified device
    PromptShareDecision {
        /// Requesting device
        device: DeviceKey,
        /// Requests the decision covers
        requests: Vec<IncomingKeyRequest>,
    },

    /// The device has nothing left awaiting a decision; close its prompt
    PromptDismissed {
        /// Requesting device
        device: DeviceKey,
    },

    /// A room key was installed; retry decrypting the session's messages
    RoomKeyReceived {
        /// Installed session
        session: InboundGroupKey,
        /// Key came from a forward rather than its creator
        forwarded: bool,
    },

    /// One of our key requests reached a terminal state
    KeyRequestFinished {
        /// Session asked for
        session: InboundGroupKey,
        /// Satisfied, Cancelled or Ignored
        state: RequestState,
    },
}
