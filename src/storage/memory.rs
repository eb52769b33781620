//! In-memory store, used by tests and throw-away nodes

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{KvStore, StoreError, Table, Visitor};

type Records = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, Records>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<R>(&self, table: Table, f: impl FnOnce(&mut Records) -> R) -> Result<R, StoreError> {
        let mut tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(tables.entry(table).or_default()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_table(table, |t| t.get(key).cloned())
    }

    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.with_table(table, |t| {
            t.insert(key.to_vec(), value.to_vec());
        })
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<(), StoreError> {
        self.with_table(table, |t| {
            t.remove(key);
        })
    }

    fn for_each(&self, table: Table, visitor: &mut Visitor<'_>) -> Result<(), StoreError> {
        // snapshot so the visitor may write back into the store
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self.with_table(table, |t| {
            t.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        })?;
        for (key, value) in snapshot {
            if !visitor(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    fn truncate(&self, table: Table) -> Result<(), StoreError> {
        self.with_table(table, |t| t.clear())
    }
}
