//! In-memory storage implementation.
//!
//! Thread-safe via Arc<Mutex>. Used by tests and the simulation harness, and
//! by ephemeral sessions that never touch disk.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError},
};

use super::{StorageError, Store, Table, Update, WriteOp};

type Rows = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory storage backed by ordered maps.
///
/// Clone shares the same underlying tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<HashMap<Table, Rows>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in a table (test oracle).
    pub fn len(&self, table: Table) -> usize {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner).get(&table).map_or(0, Rows::len)
    }

    /// True when a table holds no rows.
    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }
}

impl Store for MemoryStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(rows) = tables.get(&table) else {
            return Ok(Vec::new());
        };

        Ok(rows
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write(&self, batch: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        for op in batch {
            match op {
                WriteOp::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                },
                WriteOp::Delete { table, key } => {
                    if let Some(rows) = tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                },
            }
        }
        Ok(())
    }

    fn update(
        &self,
        table: Table,
        key: &[u8],
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<Update, StorageError>,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = tables.entry(table).or_default();

        match f(rows.get(key).map(Vec::as_slice))? {
            Update::Keep => {},
            Update::Put(value) => {
                rows.insert(key.to_vec(), value);
            },
            Update::Delete => {
                rows.remove(key);
            },
        }
        Ok(())
    }

    fn clear(&self, table: Table) -> Result<(), StorageError> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner).remove(&table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RecordStore, key};

    #[test]
    fn batch_writes_span_tables() {
        let store = MemoryStore::new();
        store
            .write(vec![
                WriteOp::Put { table: Table::Devices, key: b"a".to_vec(), value: b"1".to_vec() },
                WriteOp::Put { table: Table::Account, key: b"a".to_vec(), value: b"2".to_vec() },
            ])
            .unwrap();

        assert_eq!(store.get(Table::Devices, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(Table::Account, b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        for (user, device) in [("@b:hs", "D2"), ("@a:hs", "D1"), ("@b:hs", "D1"), ("@bb:hs", "D1")] {
            store.save(Table::Devices, &key::compose(&[user, device]), &device.to_owned()).unwrap();
        }

        let devices: Vec<String> = store.load_prefix(Table::Devices, &key::prefix(&["@b:hs"])).unwrap();
        assert_eq!(devices, vec!["D1".to_owned(), "D2".to_owned()]);
    }

    #[test]
    fn insert_if_absent_only_once() {
        let store = MemoryStore::new();
        assert!(store.insert_if_absent(Table::ReplayIndex, b"k", b"").unwrap());
        assert!(!store.insert_if_absent(Table::ReplayIndex, b"k", b"").unwrap());
        assert_eq!(store.len(Table::ReplayIndex), 1);
    }

    #[test]
    fn failed_update_writes_nothing() {
        let store = MemoryStore::new();
        let result = store.update(Table::Account, b"k", &mut |_| Err(StorageError::NotFound));

        assert_eq!(result, Err(StorageError::NotFound));
        assert!(store.is_empty(Table::Account));
    }

    #[test]
    fn clear_empties_table() {
        let store = MemoryStore::new();
        store.save(Table::Devices, b"k", &1u32).unwrap();
        store.clear(Table::Devices).unwrap();
        assert!(store.is_empty(Table::Devices));
    }
}
