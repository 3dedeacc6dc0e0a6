//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! [`Table`] maps to one redb table of raw byte keys and CBOR values.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};

use super::{StorageError, Store, Table, Update, WriteOp};

fn definition(table: Table) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    TableDefinition::new(table.name())
}

fn io(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates every table if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        for table in Table::ALL {
            let _ = txn.open_table(definition(table)).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Store for RedbStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let rows = txn.open_table(definition(table)).map_err(io)?;

        Ok(rows.get(key).map_err(io)?.map(|value| value.value().to_vec()))
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let rows = txn.open_table(definition(table)).map_err(io)?;

        let mut out = Vec::new();
        for entry in rows.range(prefix..).map_err(io)? {
            let (key, value) = entry.map_err(io)?;
            if !key.value().starts_with(prefix) {
                break;
            }
            out.push((key.value().to_vec(), value.value().to_vec()));
        }

        Ok(out)
    }

    fn write(&self, batch: Vec<WriteOp>) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;

        for op in &batch {
            match op {
                WriteOp::Put { table, key, value } => {
                    let mut rows = txn.open_table(definition(*table)).map_err(io)?;
                    rows.insert(key.as_slice(), value.as_slice()).map_err(io)?;
                },
                WriteOp::Delete { table, key } => {
                    let mut rows = txn.open_table(definition(*table)).map_err(io)?;
                    rows.remove(key.as_slice()).map_err(io)?;
                },
            }
        }

        txn.commit().map_err(io)
    }

    fn update(
        &self,
        table: Table,
        key: &[u8],
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<Update, StorageError>,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut rows = txn.open_table(definition(table)).map_err(io)?;
            let current = rows.get(key).map_err(io)?.map(|value| value.value().to_vec());

            match f(current.as_deref())? {
                Update::Keep => {},
                Update::Put(value) => {
                    rows.insert(key, value.as_slice()).map_err(io)?;
                },
                Update::Delete => {
                    rows.remove(key).map_err(io)?;
                },
            }
        }

        txn.commit().map_err(io)
    }

    fn clear(&self, table: Table) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        let _ = txn.delete_table(definition(table)).map_err(io)?;
        let _ = txn.open_table(definition(table)).map_err(io)?;
        txn.commit().map_err(io)
    }
}
