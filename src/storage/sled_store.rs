//! Database persistence layer using Sled
//!
//! One sled tree per [`Table`].

use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use super::{KvStore, StoreError, Table, Visitor};

/// Sled-backed store
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    trees: HashMap<Table, Tree>,
}

impl SledStore {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        Self::with_db(db)
    }

    /// Throw-away database, removed when dropped
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, StoreError> {
        let mut trees = HashMap::new();
        for table in Table::ALL {
            trees.insert(table, db.open_tree(table.name())?);
        }
        debug!(tables = trees.len(), "sled store opened");
        Ok(Self { db, trees })
    }

    fn tree(&self, table: Table) -> &Tree {
        // every table is opened in `with_db`
        &self.trees[&table]
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl KvStore for SledStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree(table).get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tree(table).insert(key, value)?;
        Ok(())
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<(), StoreError> {
        self.tree(table).remove(key)?;
        Ok(())
    }

    fn for_each(&self, table: Table, visitor: &mut Visitor<'_>) -> Result<(), StoreError> {
        for item in self.tree(table).iter() {
            let (key, value) = item?;
            if !visitor(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    fn truncate(&self, table: Table) -> Result<(), StoreError> {
        self.tree(table).clear()?;
        Ok(())
    }

    fn count(&self, table: Table) -> Result<usize, StoreError> {
        Ok(self.tree(table).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KvStoreExt;

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.put_encoded(Table::References, b"t:1", &42u64).unwrap();
            store.flush().unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.get_decoded::<u64>(Table::References, b"t:1").unwrap(), Some(42));
        assert_eq!(store.count(Table::References).unwrap(), 1);
        assert_eq!(store.count(Table::Pool).unwrap(), 0);
    }

    #[test]
    fn test_tables_are_separate_and_truncate() {
        let store = SledStore::temporary().unwrap();
        store.put(Table::Pool, b"k", b"pool").unwrap();
        store.put(Table::Unspent, b"k", b"utxo").unwrap();
        store.truncate(Table::Pool).unwrap();
        assert!(store.get(Table::Pool, b"k").unwrap().is_none());
        assert_eq!(store.get(Table::Unspent, b"k").unwrap(), Some(b"utxo".to_vec()));
    }
}
