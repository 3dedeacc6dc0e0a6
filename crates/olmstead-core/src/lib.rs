//! Olmstead Session Engine
//!
//! End-to-end encryption state for one device of a federated chat client:
//! pairwise (Olm) channels to every other device, group (Megolm) sessions per
//! room, the trust-gated key request protocol, and device dehydration.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!   to-device events ─►│ CryptoEngine │─► EngineActions (send, prompt, ...)
//!                      └──────┬───────┘
//!          ┌──────────────────┼───────────────────┐
//!          ▼                  ▼                   ▼
//!  KeyGossipCoordinator  GroupSessionManager  DehydrationService
//!          │                  │
//!          └───────┬──────────┘
//!                  ▼
//!          OlmChannelManager ──► KeyDirectory (claim / upload)
//!                  │
//!       ┌──────────┴──────────┐
//!       ▼                     ▼
//!  IdentityStore      SessionRepository
//!       └──────────┬──────────┘
//!                  ▼
//!            Store (memory / redb)
//! ```
//!
//! Ratchet cryptography is delegated to vodozemac. This crate decides which
//! session to use, when to rotate, who receives which key, and how to
//! recover when a pairwise channel desynchronizes.
//!
//! # Concurrency
//!
//! Pairwise operations are serialized per remote identity key and group
//! operations per room through an injectable [`LockArbiter`]. Store access is
//! synchronous and always happens under the relevant lock.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod account;
mod action;
pub mod config;
pub mod dehydration;
mod engine;
pub mod env;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod ids;
pub mod locks;
pub mod megolm;
pub mod olm;
pub mod pickle;
pub mod retry;
pub mod session_repository;
pub mod storage;
mod system_env;
pub mod transport;
pub mod wire;

pub use account::{InboundSessionError, OwnAccount};
pub use action::EngineAction;
pub use config::EngineConfig;
pub use dehydration::{
    DEHYDRATION_ALGORITHM, DehydratedDevice, DehydrationError, DehydrationKey, DehydrationService,
    RehydratedDevice, UploadableDevicePackage, rehydrate,
};
pub use engine::{CryptoEngine, EngineBuilder, EngineError};
pub use env::Environment;
pub use error::DecryptionError;
pub use gossip::{GossipError, GossipOutcome, IncomingKeyRequest, KeyGossipCoordinator};
pub use identity::{DeviceIdentity, IdentityError, IdentityStore, SignedDeviceKeys, TrustLevel};
pub use ids::{DeviceId, DeviceKey, RoomId, UserId};
pub use locks::{KeyedLocks, LockArbiter, LockGuard, LockKey};
pub use megolm::{DecryptedRoomEvent, GroupError, GroupSessionManager, ImportSummary, RoomEncryption};
pub use olm::{DecryptedPayload, HandshakeError, OlmChannelManager, OlmError};
pub use pickle::PickleKey;
pub use retry::{RetryPolicy, Retryable};
pub use session_repository::{InboundGroupKey, RequestState, SessionRepository};
pub use storage::{ChaoticStore, MemoryStore, RedbStore, StorageError, Store};
pub use system_env::SystemEnv;
pub use transport::{ClaimedOneTimeKey, KeyDirectory, OneTimeKeyUpload, SignedKey, TransportError};
pub use wire::{EncryptedRoomMessage, ToDeviceContent, ToDeviceMessage};
