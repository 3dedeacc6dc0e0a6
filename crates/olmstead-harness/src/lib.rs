//! Deterministic simulation harness for the olmstead engine.
//!
//! Runs several engines against one in-memory key directory with a virtual
//! clock and a seeded RNG. Message delivery is explicit, so tests control
//! loss, reordering and replay of to-device traffic.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod sim_env;
pub mod world;

pub use directory::{DirectoryOp, MemoryDirectory};
pub use sim_env::SimEnv;
pub use world::{SimEngine, TestDevice, World};
