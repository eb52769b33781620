//! Block structure
//!
//! A block is immutable once sealed: `hash` and `nonce` come from the
//! proof-of-work search over the other fields.

use serde::{Deserialize, Serialize};

use crate::crypto::{merkle_root_of, Hash};
use crate::validation::Transaction;

/// A complete block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    /// Seconds since Unix epoch
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    /// Zero for the genesis block
    pub prev_hash: Hash,
    pub hash: Hash,
    pub nonce: u64,
    pub height: u64,
}

/// Lightweight projection used for chain bookkeeping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockShort {
    pub prev_hash: Hash,
    pub hash: Hash,
    pub height: u64,
}

impl Block {
    /// Unsealed block on top of `prev_hash`
    pub fn new(prev_hash: Hash, height: u64, timestamp: u64, transactions: Vec<Transaction>) -> Self {
        Self {
            timestamp,
            transactions,
            prev_hash,
            hash: Hash::zero(),
            nonce: 0,
            height,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }

    pub fn short(&self) -> BlockShort {
        BlockShort {
            prev_hash: self.prev_hash,
            hash: self.hash,
            height: self.height,
        }
    }

    /// Merkle root over the serialized transactions
    pub fn transactions_root(&self) -> Result<Hash, bincode::Error> {
        let leaves = self
            .transactions
            .iter()
            .map(Transaction::to_bytes)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(merkle_root_of(&leaves))
    }

    pub fn find_transaction(&self, tx_id: &Hash) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.id == *tx_id)
    }

    /// Transactions other than the coinbase
    pub fn regular_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| !tx.is_coinbase())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
