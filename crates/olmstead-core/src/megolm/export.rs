//! Passphrase-protected export and import of inbound room keys.

use olmstead_crypto::{decrypt_key_export, encrypt_key_export};
use tracing::{info, warn};

use super::{GroupError, GroupSessionManager};
use crate::{
    env::Environment,
    identity::MEGOLM_ALGORITHM,
    session_repository::InboundGroupKey,
    storage::Store,
    transport::KeyDirectory,
    wire::ExportedRoomKey,
};

/// Outcome of importing an export file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Sessions that were new or improved an existing one
    pub imported: usize,
    /// Sessions we already held at an equal or earlier index
    pub skipped: usize,
    /// Entries that could not be used
    pub invalid: usize,
}

impl<S: Store, D: KeyDirectory, E: Environment> GroupSessionManager<S, D, E> {
    /// Export every inbound session at its first known index into the
    /// armoured `MEGOLM SESSION DATA` format.
    pub fn export_room_keys(&self, passphrase: &str, rounds: u32) -> Result<String, GroupError> {
        let keys: Vec<ExportedRoomKey> = self
            .sessions
            .inbound_sessions(None)?
            .into_iter()
            .map(|inbound| ExportedRoomKey {
                algorithm: MEGOLM_ALGORITHM.to_owned(),
                room_id: inbound.key.room_id,
                sender_key: inbound.key.sender_key,
                session_id: inbound.key.session_id,
                session_key: inbound.session.export_at_first_known_index().to_base64(),
                sender_claimed_keys: Default::default(),
            })
            .collect();

        let plaintext = serde_json::to_vec(&keys)
            .map_err(|e| GroupError::InvalidRoomKey { reason: e.to_string() })?;
        let armored = encrypt_key_export(
            &plaintext,
            passphrase,
            rounds,
            self.env.random_array(),
            self.env.random_array(),
        )?;

        info!(sessions = keys.len(), rounds, "exported room keys");
        Ok(armored)
    }

    /// Import an export file. Existing sessions are never downgraded.
    pub async fn import_room_keys(&self, armored: &str, passphrase: &str) -> Result<ImportSummary, GroupError> {
        let plaintext = decrypt_key_export(armored, passphrase)?;
        let keys: Vec<ExportedRoomKey> = serde_json::from_slice(&plaintext)
            .map_err(|e| GroupError::InvalidRoomKey { reason: e.to_string() })?;

        let mut summary = ImportSummary::default();
        for key in keys {
            if key.algorithm != MEGOLM_ALGORITHM {
                summary.invalid += 1;
                continue;
            }
            let target = InboundGroupKey {
                room_id: key.room_id,
                sender_key: key.sender_key,
                session_id: key.session_id,
            };
            match self.import_forwarded(target, &key.session_key).await {
                Ok(true) => summary.imported += 1,
                Ok(false) => summary.skipped += 1,
                Err(GroupError::InvalidRoomKey { reason }) => {
                    warn!(%reason, "skipping unusable exported key");
                    summary.invalid += 1;
                },
                Err(err) => return Err(err),
            }
        }

        info!(imported = summary.imported, skipped = summary.skipped, invalid = summary.invalid, "imported room keys");
        Ok(summary)
    }
}
