//! Storage abstraction for account, device and session state.
//!
//! A deliberately small transactional key-value interface: point reads,
//! prefix scans, atomic multi-table batches and a read-modify-write
//! primitive. The engine never assumes a particular storage engine; records
//! are CBOR-encoded by [`RecordStore`] on top of raw bytes.
//!
//! The trait is synchronous. Store access is assumed fast and is always
//! performed while holding the per-device or per-room lock that guards the
//! record being mutated.

mod chaotic;
mod error;
pub mod key;
mod memory;
mod redb;

pub use chaotic::ChaoticStore;
pub use error::StorageError;
pub use memory::MemoryStore;
use serde::{Serialize, de::DeserializeOwned};

pub use self::redb::RedbStore;

/// Logical tables. Every backend creates all of them up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Own pickled account (single row)
    Account,
    /// Remote device identities keyed by `(user, device)`
    Devices,
    /// Secondary index: identity key → `(user, device)`
    DevicesByIdentityKey,
    /// Pairwise sessions keyed by `(identity key, session id)`
    PairwiseSessions,
    /// Outbound group sessions keyed by `(room, session id)`
    OutboundGroupSessions,
    /// Inbound group sessions keyed by `(room, sender key, session id)`
    InboundGroupSessions,
    /// Seen `(room, sender key, session id, index)` markers
    ReplayIndex,
    /// Our own outstanding key requests keyed by `(room, session id)`
    OutgoingKeyRequests,
}

impl Table {
    /// Every table, in creation order.
    pub const ALL: [Self; 8] = [
        Self::Account,
        Self::Devices,
        Self::DevicesByIdentityKey,
        Self::PairwiseSessions,
        Self::OutboundGroupSessions,
        Self::InboundGroupSessions,
        Self::ReplayIndex,
        Self::OutgoingKeyRequests,
    ];

    /// Stable on-disk name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Devices => "devices",
            Self::DevicesByIdentityKey => "devices_by_identity_key",
            Self::PairwiseSessions => "pairwise_sessions",
            Self::OutboundGroupSessions => "outbound_group_sessions",
            Self::InboundGroupSessions => "inbound_group_sessions",
            Self::ReplayIndex => "replay_index",
            Self::OutgoingKeyRequests => "outgoing_key_requests",
        }
    }
}

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite
    Put {
        /// Target table
        table: Table,
        /// Row key
        key: Vec<u8>,
        /// Row value
        value: Vec<u8>,
    },
    /// Remove if present
    Delete {
        /// Target table
        table: Table,
        /// Row key
        key: Vec<u8>,
    },
}

/// Decision returned by a read-modify-write closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Leave the row untouched
    Keep,
    /// Replace (or create) the row
    Put(Vec<u8>),
    /// Remove the row
    Delete,
}

/// Storage abstraction for engine state.
///
/// Must be Clone (shared by every manager), Send + Sync (thread-safe), and
/// synchronous. Implementations share internal state via Arc, so clones
/// access the same underlying storage.
pub trait Store: Clone + Send + Sync + 'static {
    /// Read one row.
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// All rows whose key starts with `prefix`, in key order.
    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply every operation atomically, or none of them.
    fn write(&self, batch: Vec<WriteOp>) -> Result<(), StorageError>;

    /// Atomic read-modify-write of a single row.
    ///
    /// The closure sees the current value and decides the new one. No other
    /// writer can interleave between the read and the write. If the closure
    /// fails, nothing is written.
    fn update(
        &self,
        table: Table,
        key: &[u8],
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<Update, StorageError>,
    ) -> Result<(), StorageError>;

    /// Remove every row from a table.
    fn clear(&self, table: Table) -> Result<(), StorageError>;

    /// Insert `value` only if `key` is absent. Returns `true` if inserted.
    fn insert_if_absent(&self, table: Table, key: &[u8], value: &[u8]) -> Result<bool, StorageError> {
        let mut inserted = false;
        self.update(table, key, &mut |current| {
            if current.is_some() {
                inserted = false;
                Ok(Update::Keep)
            } else {
                inserted = true;
                Ok(Update::Put(value.to_vec()))
            }
        })?;
        Ok(inserted)
    }
}

/// Typed CBOR records on top of any [`Store`].
pub trait RecordStore: Store {
    /// Load and decode one record.
    fn load<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>, StorageError> {
        self.get(table, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    /// Load and decode every record under `prefix`.
    fn load_prefix<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<T>, StorageError> {
        self.scan_prefix(table, prefix)?.iter().map(|(_, bytes)| decode(bytes)).collect()
    }

    /// Encode and store one record.
    fn save<T: Serialize>(&self, table: Table, key: &[u8], record: &T) -> Result<(), StorageError> {
        self.write(vec![put_op(table, key, record)?])
    }

    /// Remove one record.
    fn remove(&self, table: Table, key: &[u8]) -> Result<(), StorageError> {
        self.write(vec![WriteOp::Delete { table, key: key.to_vec() }])
    }
}

impl<S: Store> RecordStore for S {}

/// Build a `Put` operation for a CBOR-encoded record.
pub fn put_op<T: Serialize>(table: Table, key: &[u8], record: &T) -> Result<WriteOp, StorageError> {
    Ok(WriteOp::Put { table, key: key.to_vec(), value: encode(record)? })
}

/// CBOR-encode a record.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// CBOR-decode a record.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
