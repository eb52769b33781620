//! Key-value capability the core is written against
//!
//! Every entity crosses this boundary as opaque bincode bytes. Each call is
//! atomic on its own; multi-step sequences are not transactional.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Logical tables of the node database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// hash -> block, plus the "l" (tip) and "f" (genesis) keys
    Blocks,
    /// hash -> prev || next
    Chain,
    /// tx id -> hashes of blocks containing the transaction
    TxBlocks,
    /// tx id -> spent-output records
    TxSpent,
    /// tx id -> unspent outputs
    Unspent,
    /// tx id -> pending transaction
    Pool,
    /// reference id -> tx id that last touched it
    References,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Blocks,
        Table::Chain,
        Table::TxBlocks,
        Table::TxSpent,
        Table::Unspent,
        Table::Pool,
        Table::References,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Blocks => "blocks",
            Table::Chain => "chain",
            Table::TxBlocks => "tx_blocks",
            Table::TxSpent => "tx_spent",
            Table::Unspent => "unspent",
            Table::Pool => "pool",
            Table::References => "references",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage engine error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Corrupt record in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Visitor used by [`KvStore::for_each`]. Return `Ok(false)` to stop early.
pub type Visitor<'v> = dyn FnMut(&[u8], &[u8]) -> Result<bool, StoreError> + 'v;

pub trait KvStore: Send + Sync {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, table: Table, key: &[u8]) -> Result<(), StoreError>;

    /// Visit every record. The store must tolerate writes from the visitor.
    fn for_each(&self, table: Table, visitor: &mut Visitor<'_>) -> Result<(), StoreError>;

    fn truncate(&self, table: Table) -> Result<(), StoreError>;

    fn count(&self, table: Table) -> Result<usize, StoreError> {
        let mut n = 0;
        self.for_each(table, &mut |_, _| {
            n += 1;
            Ok(true)
        })?;
        Ok(n)
    }

    fn exists(&self, table: Table, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(table, key)?.is_some())
    }
}

/// Typed access on top of any [`KvStore`]
pub trait KvStoreExt: KvStore {
    fn get_decoded<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.get(table, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_encoded<T: Serialize>(&self, table: Table, key: &[u8], value: &T) -> Result<(), StoreError> {
        self.put(table, key, &bincode::serialize(value)?)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}
