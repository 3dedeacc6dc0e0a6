//! At-rest encryption key for ratchet pickles.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// 32-byte key encrypting every pickle written to the store.
///
/// The engine never persists this key; the embedding client derives or
/// fetches it (e.g. from the OS keychain) on each start.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PickleKey([u8; 32]);

impl PickleKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes, for handing to the ratchet library.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PickleKey(..)")
    }
}
