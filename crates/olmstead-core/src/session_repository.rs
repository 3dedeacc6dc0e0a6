//! Persistence for pairwise and group ratchets.
//!
//! Ratchets are stored as encrypted vodozemac pickles inside CBOR records.
//! The repository never decides anything: selection, rotation and sharing
//! policy live in the managers, which call in here while holding the lock
//! for the device or room they mutate.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use vodozemac::{
    megolm::{GroupSession, GroupSessionPickle, InboundGroupSession, InboundGroupSessionPickle},
    olm::{Session, SessionPickle},
};

use crate::{
    ids::{DeviceKey, RoomId},
    pickle::PickleKey,
    storage::{RecordStore, StorageError, Store, Table, WriteOp, key, put_op},
};

/// A pairwise ratchet with its recency stamp.
pub struct PairwiseSession {
    /// Ratchet session id
    pub session_id: String,
    /// When the session was created (ms)
    pub created_at: u64,
    /// Last successful encrypt or decrypt; strictly increasing per device
    pub last_used_at: u64,
    /// The ratchet
    pub session: Session,
}

#[derive(Serialize, Deserialize)]
struct PairwiseRecord {
    session_id: String,
    created_at: u64,
    last_used_at: u64,
    pickle: String,
}

/// Outcome of sharing an outbound session with one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    /// Recipient
    pub device: DeviceKey,
    /// Chain index the key was shared at
    pub message_index: u32,
}

/// The active outbound group session of a room.
pub struct OutboundRoomSession {
    /// Room
    pub room_id: RoomId,
    /// The ratchet
    pub session: GroupSession,
    /// Creation time (ms)
    pub created_at: u64,
    /// Messages encrypted so far
    pub message_count: u64,
    /// Devices that received the key, and at which index
    pub shared_with: BTreeMap<DeviceKey, u32>,
    /// Devices that were sent a withheld notice instead
    pub withheld: BTreeSet<DeviceKey>,
    /// Membership or settings changed; rotate before next use
    pub invalidated: bool,
}

impl OutboundRoomSession {
    /// Ratchet session id.
    pub fn session_id(&self) -> String {
        self.session.session_id()
    }
}

#[derive(Serialize, Deserialize)]
struct OutboundRecord {
    room_id: RoomId,
    created_at: u64,
    message_count: u64,
    shared_with: Vec<ShareRecord>,
    withheld: Vec<DeviceKey>,
    invalidated: bool,
    pickle: String,
}

/// Identifies an inbound group ratchet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InboundGroupKey {
    /// Room
    pub room_id: RoomId,
    /// Creator's Curve25519 key (base64)
    pub sender_key: String,
    /// Group session id
    pub session_id: String,
}

impl InboundGroupKey {
    fn row(&self) -> Vec<u8> {
        key::compose(&[self.room_id.as_str(), &self.sender_key, &self.session_id])
    }
}

/// An inbound group ratchet.
pub struct InboundRoomSession {
    /// Where it belongs
    pub key: InboundGroupKey,
    /// The ratchet
    pub session: InboundGroupSession,
    /// Received via key forwarding rather than from its creator
    pub forwarded: bool,
}

#[derive(Serialize, Deserialize)]
struct InboundRecord {
    key: InboundGroupKey,
    first_known_index: u32,
    forwarded: bool,
    pickle: String,
}

/// Lifecycle of one of our own key requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Sent, waiting for a forward
    Pending,
    /// Key arrived
    Satisfied,
    /// Withdrawn
    Cancelled,
    /// Every target withheld the key
    Ignored,
}

impl RequestState {
    /// No further transitions.
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// A key request we sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingKeyRequest {
    /// Request id shared with its cancellation
    pub request_id: String,
    /// Wanted session
    pub session: InboundGroupKey,
    /// Devices the request went to
    pub targets: Vec<DeviceKey>,
    /// Targets that answered with a withheld notice
    pub withheld_by: Vec<DeviceKey>,
    /// Current state
    pub state: RequestState,
}

/// Pickle and record storage for every ratchet.
#[derive(Clone)]
pub struct SessionRepository<S: Store> {
    store: S,
    pickle_key: PickleKey,
}

impl<S: Store> SessionRepository<S> {
    /// Repository over `store`, pickling under `pickle_key`.
    pub fn new(store: S, pickle_key: PickleKey) -> Self {
        Self { store, pickle_key }
    }

    /// Underlying store, for batching writes across repositories.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Every pairwise session with `identity_key`, most recently used first.
    pub fn pairwise_sessions(&self, identity_key: &str) -> Result<Vec<PairwiseSession>, StorageError> {
        let records: Vec<PairwiseRecord> =
            self.store.load_prefix(Table::PairwiseSessions, &key::prefix(&[identity_key]))?;

        let mut sessions = records
            .into_iter()
            .map(|record| {
                let pickle = SessionPickle::from_encrypted(&record.pickle, self.pickle_key.as_bytes())
                    .map_err(|e| StorageError::Corrupted(format!("pairwise pickle {}: {e}", record.session_id)))?;
                Ok(PairwiseSession {
                    session_id: record.session_id,
                    created_at: record.created_at,
                    last_used_at: record.last_used_at,
                    session: Session::from_pickle(pickle),
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;

        sessions.sort_by(|a, b| {
            b.last_used_at.cmp(&a.last_used_at).then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(sessions)
    }

    /// Write operation persisting one pairwise session.
    pub fn pairwise_op(&self, identity_key: &str, session: &PairwiseSession) -> Result<WriteOp, StorageError> {
        let record = PairwiseRecord {
            session_id: session.session_id.clone(),
            created_at: session.created_at,
            last_used_at: session.last_used_at,
            pickle: session.session.pickle().encrypt(self.pickle_key.as_bytes()),
        };
        put_op(Table::PairwiseSessions, &key::compose(&[identity_key, &session.session_id]), &record)
    }

    /// Persist one pairwise session.
    pub fn save_pairwise(&self, identity_key: &str, session: &PairwiseSession) -> Result<(), StorageError> {
        self.store.write(vec![self.pairwise_op(identity_key, session)?])
    }

    /// The active outbound group session of `room`, if any.
    pub fn outbound(&self, room: &RoomId) -> Result<Option<OutboundRoomSession>, StorageError> {
        let Some(record) =
            self.store.load::<OutboundRecord>(Table::OutboundGroupSessions, &key::compose(&[room.as_str()]))?
        else {
            return Ok(None);
        };

        let pickle = GroupSessionPickle::from_encrypted(&record.pickle, self.pickle_key.as_bytes())
            .map_err(|e| StorageError::Corrupted(format!("outbound pickle for {room}: {e}")))?;

        Ok(Some(OutboundRoomSession {
            room_id: record.room_id,
            session: GroupSession::from_pickle(pickle),
            created_at: record.created_at,
            message_count: record.message_count,
            shared_with: record.shared_with.into_iter().map(|s| (s.device, s.message_index)).collect(),
            withheld: record.withheld.into_iter().collect(),
            invalidated: record.invalidated,
        }))
    }

    /// Write operation replacing the room's outbound session.
    pub fn outbound_op(&self, session: &OutboundRoomSession) -> Result<WriteOp, StorageError> {
        let record = OutboundRecord {
            room_id: session.room_id.clone(),
            created_at: session.created_at,
            message_count: session.message_count,
            shared_with: session
                .shared_with
                .iter()
                .map(|(device, index)| ShareRecord { device: device.clone(), message_index: *index })
                .collect(),
            withheld: session.withheld.iter().cloned().collect(),
            invalidated: session.invalidated,
            pickle: session.session.pickle().encrypt(self.pickle_key.as_bytes()),
        };
        put_op(Table::OutboundGroupSessions, &key::compose(&[session.room_id.as_str()]), &record)
    }

    /// Persist the room's outbound session.
    pub fn save_outbound(&self, session: &OutboundRoomSession) -> Result<(), StorageError> {
        self.store.write(vec![self.outbound_op(session)?])
    }

    /// Load one inbound group session.
    pub fn inbound(&self, key: &InboundGroupKey) -> Result<Option<InboundRoomSession>, StorageError> {
        self.store
            .load::<InboundRecord>(Table::InboundGroupSessions, &key.row())?
            .map(|record| self.unpickle_inbound(record))
            .transpose()
    }

    /// Every inbound group session, optionally limited to one room.
    pub fn inbound_sessions(&self, room: Option<&RoomId>) -> Result<Vec<InboundRoomSession>, StorageError> {
        let prefix = room.map(|r| key::prefix(&[r.as_str()])).unwrap_or_default();
        self.store
            .load_prefix::<InboundRecord>(Table::InboundGroupSessions, &prefix)?
            .into_iter()
            .map(|record| self.unpickle_inbound(record))
            .collect()
    }

    fn unpickle_inbound(&self, record: InboundRecord) -> Result<InboundRoomSession, StorageError> {
        let pickle = InboundGroupSessionPickle::from_encrypted(&record.pickle, self.pickle_key.as_bytes())
            .map_err(|e| StorageError::Corrupted(format!("inbound pickle {}: {e}", record.key.session_id)))?;
        Ok(InboundRoomSession {
            key: record.key,
            session: InboundGroupSession::from_pickle(pickle),
            forwarded: record.forwarded,
        })
    }

    /// Write operation persisting one inbound group session.
    pub fn inbound_op(&self, session: &InboundRoomSession) -> Result<WriteOp, StorageError> {
        let record = InboundRecord {
            key: session.key.clone(),
            first_known_index: session.session.first_known_index(),
            forwarded: session.forwarded,
            pickle: session.session.pickle().encrypt(self.pickle_key.as_bytes()),
        };
        put_op(Table::InboundGroupSessions, &session.key.row(), &record)
    }

    /// Persist one inbound group session.
    pub fn save_inbound(&self, session: &InboundRoomSession) -> Result<(), StorageError> {
        self.store.write(vec![self.inbound_op(session)?])
    }

    /// Record that `(session, index)` was decrypted. Returns `false` if it
    /// had been recorded before.
    pub fn mark_decrypted(&self, key: &InboundGroupKey, message_index: u32) -> Result<bool, StorageError> {
        let row = key::compose(&[
            key.room_id.as_str(),
            &key.sender_key,
            &key.session_id,
            &message_index.to_string(),
        ]);
        self.store.insert_if_absent(Table::ReplayIndex, &row, &[])
    }

    /// Our key request for a session, whatever its state.
    pub fn outgoing_request(&self, room: &RoomId, session_id: &str) -> Result<Option<OutgoingKeyRequest>, StorageError> {
        self.store.load(Table::OutgoingKeyRequests, &key::compose(&[room.as_str(), session_id]))
    }

    /// Persist a key request.
    pub fn save_outgoing_request(&self, request: &OutgoingKeyRequest) -> Result<(), StorageError> {
        self.store.write(vec![self.outgoing_request_op(request)?])
    }

    /// Write operation persisting a key request.
    pub fn outgoing_request_op(&self, request: &OutgoingKeyRequest) -> Result<WriteOp, StorageError> {
        put_op(
            Table::OutgoingKeyRequests,
            &key::compose(&[request.session.room_id.as_str(), &request.session.session_id]),
            request,
        )
    }

    /// Every outstanding key request.
    pub fn pending_requests(&self) -> Result<Vec<OutgoingKeyRequest>, StorageError> {
        let all: Vec<OutgoingKeyRequest> = self.store.load_prefix(Table::OutgoingKeyRequests, &[])?;
        Ok(all.into_iter().filter(|r| r.state == RequestState::Pending).collect())
    }

    /// Drop every ratchet, replay marker and request (logout).
    pub fn clear(&self) -> Result<(), StorageError> {
        for table in [
            Table::PairwiseSessions,
            Table::OutboundGroupSessions,
            Table::InboundGroupSessions,
            Table::ReplayIndex,
            Table::OutgoingKeyRequests,
        ] {
            self.store.clear(table)?;
        }
        Ok(())
    }
}

/// Next `last_used_at` for a device: wall clock, but strictly after every
/// stamp already handed out to its sessions.
pub fn next_stamp(sessions: &[PairwiseSession], now: u64) -> u64 {
    sessions.iter().map(|s| s.last_used_at.saturating_add(1)).max().map_or(now, |floor| floor.max(now))
}

#[cfg(test)]
mod tests {
    use vodozemac::{
        megolm::SessionConfig as MegolmConfig,
        olm::{Account, SessionConfig},
    };

    use super::*;
    use crate::storage::MemoryStore;

    fn repo() -> SessionRepository<MemoryStore> {
        SessionRepository::new(MemoryStore::new(), PickleKey::new([9; 32]))
    }

    fn pairwise(stamp: u64) -> PairwiseSession {
        let alice = Account::new();
        let mut bob = Account::new();
        let _ = bob.generate_one_time_keys(1);
        let otk = *bob.one_time_keys().values().next().unwrap();
        let session = alice.create_outbound_session(SessionConfig::version_1(), bob.curve25519_key(), otk);
        PairwiseSession { session_id: session.session_id(), created_at: 0, last_used_at: stamp, session }
    }

    #[test]
    fn pairwise_sessions_ordered_by_recency() {
        let repo = repo();
        let old = pairwise(10);
        let new = pairwise(20);
        let (old_id, new_id) = (old.session_id.clone(), new.session_id.clone());
        repo.save_pairwise("bobkey", &old).unwrap();
        repo.save_pairwise("bobkey", &new).unwrap();
        repo.save_pairwise("carolkey", &pairwise(99)).unwrap();

        let ids: Vec<_> = repo.pairwise_sessions("bobkey").unwrap().into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec![new_id, old_id]);
    }

    #[test]
    fn stamps_increase_even_when_clock_stalls() {
        let sessions = vec![pairwise(100), pairwise(50)];
        assert_eq!(next_stamp(&sessions, 100), 101);
        assert_eq!(next_stamp(&sessions, 500), 500);
        assert_eq!(next_stamp(&[], 7), 7);
    }

    #[test]
    fn wrong_pickle_key_is_corruption() {
        let store = MemoryStore::new();
        SessionRepository::new(store.clone(), PickleKey::new([1; 32])).save_pairwise("k", &pairwise(1)).unwrap();

        let result = SessionRepository::new(store, PickleKey::new([2; 32])).pairwise_sessions("k");
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn outbound_roundtrip_keeps_sharing_history() {
        let repo = repo();
        let room = RoomId::new("!r:hs");
        let mut outbound = OutboundRoomSession {
            room_id: room.clone(),
            session: GroupSession::new(MegolmConfig::version_1()),
            created_at: 5,
            message_count: 3,
            shared_with: BTreeMap::new(),
            withheld: BTreeSet::new(),
            invalidated: false,
        };
        outbound.shared_with.insert(DeviceKey::new("@b:hs", "B"), 2);
        repo.save_outbound(&outbound).unwrap();

        let loaded = repo.outbound(&room).unwrap().unwrap();
        assert_eq!(loaded.session_id(), outbound.session_id());
        assert_eq!(loaded.shared_with.get(&DeviceKey::new("@b:hs", "B")), Some(&2));
        assert_eq!(loaded.message_count, 3);
    }

    #[test]
    fn replay_markers_are_set_once() {
        let repo = repo();
        let key = InboundGroupKey { room_id: RoomId::new("!r:hs"), sender_key: "a".into(), session_id: "s".into() };

        assert!(repo.mark_decrypted(&key, 0).unwrap());
        assert!(!repo.mark_decrypted(&key, 0).unwrap());
        assert!(repo.mark_decrypted(&key, 1).unwrap());
    }

    #[test]
    fn pending_requests_skip_terminal_states() {
        let repo = repo();
        let session = |id: &str| InboundGroupKey { room_id: RoomId::new("!r:hs"), sender_key: "a".into(), session_id: id.into() };
        for (id, state) in [("s1", RequestState::Pending), ("s2", RequestState::Cancelled)] {
            repo.save_outgoing_request(&OutgoingKeyRequest {
                request_id: id.to_uppercase(),
                session: session(id),
                targets: vec![],
                withheld_by: vec![],
                state,
            })
            .unwrap();
        }

        let pending = repo.pending_requests().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, "S1");
    }
}
