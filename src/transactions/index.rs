//! Transaction index
//!
//! Which blocks contain a transaction (any branch), and which of its outputs were
//! spent by which block. Lookups are scoped to the branch under a given tip.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::TxError;
use crate::blockchain::Blockchain;
use crate::consensus::Block;
use crate::crypto::Hash;
use crate::storage::{KvStore, KvStoreExt, Table};
use crate::validation::Transaction;

/// Output `out_index` was consumed by input `in_index` of `spending_tx_id` in `block_hash`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentOutput {
    pub out_index: u32,
    pub spending_tx_id: Hash,
    pub in_index: u32,
    pub block_hash: Hash,
}

/// Confirmed transaction as seen under some tip
#[derive(Debug, Clone)]
pub struct IndexedTransaction {
    pub tx: Transaction,
    pub block_hash: Hash,
    /// Spends visible between `block_hash` and the tip
    pub spent: Vec<SpentOutput>,
}

#[derive(Clone)]
pub struct TransactionIndex {
    store: Arc<dyn KvStore>,
    blockchain: Blockchain,
}

impl TransactionIndex {
    pub fn new(store: Arc<dyn KvStore>, blockchain: Blockchain) -> Self {
        Self { store, blockchain }
    }

    pub fn block_added(&self, block: &Block) -> Result<(), TxError> {
        for tx in &block.transactions {
            let mut blocks = self.get_transaction_blocks(&tx.id)?;
            if !blocks.contains(&block.hash) {
                blocks.push(block.hash);
                self.store.put_encoded(Table::TxBlocks, &tx.id.0, &blocks)?;
            }

            if tx.is_coinbase() {
                continue;
            }
            for (in_index, input) in tx.inputs.iter().enumerate() {
                let record = SpentOutput {
                    out_index: input.out_index,
                    spending_tx_id: tx.id,
                    in_index: in_index as u32,
                    block_hash: block.hash,
                };
                let mut spent = self.get_spent_records(&input.tx_id)?;
                if !spent.contains(&record) {
                    spent.push(record);
                    self.store.put_encoded(Table::TxSpent, &input.tx_id.0, &spent)?;
                }
            }
        }
        debug!(hash = %block.hash, txs = block.transactions.len(), "transactions indexed");
        Ok(())
    }

    pub fn block_removed(&self, block: &Block) -> Result<(), TxError> {
        for tx in &block.transactions {
            let mut blocks = self.get_transaction_blocks(&tx.id)?;
            blocks.retain(|h| *h != block.hash);
            if blocks.is_empty() {
                self.store.delete(Table::TxBlocks, &tx.id.0)?;
            } else {
                self.store.put_encoded(Table::TxBlocks, &tx.id.0, &blocks)?;
            }

            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                let mut spent = self.get_spent_records(&input.tx_id)?;
                spent.retain(|s| {
                    !(s.out_index == input.out_index
                        && s.spending_tx_id == tx.id
                        && s.block_hash == block.hash)
                });
                if spent.is_empty() {
                    self.store.delete(Table::TxSpent, &input.tx_id.0)?;
                } else {
                    self.store.put_encoded(Table::TxSpent, &input.tx_id.0, &spent)?;
                }
            }
        }
        debug!(hash = %block.hash, "transactions unindexed");
        Ok(())
    }

    /// Drop everything and index every stored canonical block again
    pub fn reindex(&self) -> Result<usize, TxError> {
        self.store.truncate(Table::TxBlocks)?;
        self.store.truncate(Table::TxSpent)?;
        let mut blocks = 0;
        for block in self.blockchain.iter()? {
            self.block_added(&block?)?;
            blocks += 1;
        }
        Ok(blocks)
    }

    pub fn get_transaction_blocks(&self, tx_id: &Hash) -> Result<Vec<Hash>, TxError> {
        Ok(self
            .store
            .get_decoded(Table::TxBlocks, &tx_id.0)?
            .unwrap_or_default())
    }

    fn get_spent_records(&self, tx_id: &Hash) -> Result<Vec<SpentOutput>, TxError> {
        Ok(self
            .store
            .get_decoded(Table::TxSpent, &tx_id.0)?
            .unwrap_or_default())
    }

    /// Spends of `tx_id` (confirmed in `block_hash`) that are visible under `tip`
    pub fn get_transaction_outputs_spent(&self, tx_id: &Hash, block_hash: &Hash, tip: &Hash) -> Result<Vec<SpentOutput>, TxError> {
        let mut visible = Vec::new();
        for record in self.get_spent_records(tx_id)? {
            if self
                .blockchain
                .check_block_is_in_range(&record.block_hash, block_hash, tip)?
            {
                visible.push(record);
            }
        }
        Ok(visible)
    }

    /// Transaction, containing block and visible spends under `tip` (zero = canonical)
    pub fn get_currency_transaction_all_info(&self, tx_id: &Hash, tip: &Hash) -> Result<Option<IndexedTransaction>, TxError> {
        let blocks = self.get_transaction_blocks(tx_id)?;
        let Some(block_hash) = self.blockchain.choose_hash_under_tip(&blocks, tip)? else {
            return Ok(None);
        };
        let Some(tx) = self.blockchain.get_transaction_from_block(tx_id, &block_hash)? else {
            return Ok(None);
        };
        let spent = self.get_transaction_outputs_spent(tx_id, &block_hash, tip)?;
        Ok(Some(IndexedTransaction { tx, block_hash, spent }))
    }

    pub fn get_transaction(&self, tx_id: &Hash, tip: &Hash) -> Result<Option<(Transaction, Hash)>, TxError> {
        let blocks = self.get_transaction_blocks(tx_id)?;
        let Some(block_hash) = self.blockchain.choose_hash_under_tip(&blocks, tip)? else {
            return Ok(None);
        };
        Ok(self
            .blockchain
            .get_transaction_from_block(tx_id, &block_hash)?
            .map(|tx| (tx, block_hash)))
    }

    pub fn count(&self) -> Result<usize, TxError> {
        Ok(self.store.count(Table::TxBlocks)?)
    }
}
