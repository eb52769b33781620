//! Reference index: `reference_id -> id of the last canonical transaction
//! that mutated it`

use std::sync::Arc;
use tracing::trace;

use super::{TransactionIndex, TxError};
use crate::blockchain::Blockchain;
use crate::consensus::Block;
use crate::crypto::Hash;
use crate::storage::{KvStore, KvStoreExt, Table};

#[derive(Clone)]
pub struct ReferenceIndex {
    store: Arc<dyn KvStore>,
    blockchain: Blockchain,
    index: TransactionIndex,
}

impl ReferenceIndex {
    pub fn new(store: Arc<dyn KvStore>, blockchain: Blockchain, index: TransactionIndex) -> Self {
        Self { store, blockchain, index }
    }

    pub fn get(&self, reference_id: &str) -> Result<Option<Hash>, TxError> {
        Ok(self
            .store
            .get_decoded(Table::References, reference_id.as_bytes())?)
    }

    fn set(&self, reference_id: &str, tx_id: &Hash) -> Result<(), TxError> {
        Ok(self
            .store
            .put_encoded(Table::References, reference_id.as_bytes(), tx_id)?)
    }

    pub fn block_added(&self, block: &Block) -> Result<(), TxError> {
        for tx in &block.transactions {
            if let Some(sql) = &tx.sql {
                self.set(&sql.reference_id, &tx.id)?;
                trace!(reference = %sql.reference_id, tx = %tx.id, "reference moved");
            }
        }
        Ok(())
    }

    /// Point each reference the block touched back at its previous holder
    pub fn block_removed(&self, block: &Block) -> Result<(), TxError> {
        for tx in block.transactions.iter().rev() {
            let Some(sql) = &tx.sql else {
                continue;
            };
            if self.get(&sql.reference_id)? != Some(tx.id) {
                continue;
            }

            let restored = match sql.base_tx {
                Some(base_id) => {
                    let base = match block.find_transaction(&base_id) {
                        Some(tx) => Some(tx.clone()),
                        None => self
                            .index
                            .get_transaction(&base_id, &block.prev_hash)?
                            .map(|(tx, _)| tx),
                    };
                    base.filter(|b| b.sql_reference() == Some(sql.reference_id.as_str()))
                        .map(|b| b.id)
                }
                None => None,
            };

            match restored {
                Some(base_id) => self.set(&sql.reference_id, &base_id)?,
                None => self
                    .store
                    .delete(Table::References, sql.reference_id.as_bytes())?,
            }
        }
        Ok(())
    }

    /// Rebuild from the canonical chain, genesis first
    pub fn reindex(&self) -> Result<usize, TxError> {
        self.store.truncate(Table::References)?;
        let shorts = self.blockchain.get_blocks_short_info(&Hash::zero(), usize::MAX)?;
        for short in shorts.iter().rev() {
            self.block_added(&self.blockchain.get_block(&short.hash)?)?;
        }
        Ok(self.store.count(Table::References)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_bytes, PrivateKey};
    use crate::storage::MemoryStore;
    use crate::validation::{SqlUpdate, Transaction};

    fn sql_tx(key: &PrivateKey, reference: &str, query: &str, base: Option<Hash>) -> Transaction {
        let sql = SqlUpdate::new(reference, query, format!("UNDO {query}")).with_base(base);
        Transaction::signed(key, vec![], vec![], Some(sql))
    }

    #[test]
    fn test_reference_follows_history() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let blockchain = Blockchain::new(store.clone());
        let index = TransactionIndex::new(store.clone(), blockchain.clone());
        let refs = ReferenceIndex::new(store, blockchain.clone(), index.clone());
        let key = PrivateKey::generate();

        let mut genesis = Block::new(Hash::zero(), 0, 0, vec![]);
        genesis.hash = hash_bytes(b"genesis");
        blockchain.create_genesis(&genesis).unwrap();

        let create = sql_tx(&key, "t:*", "CREATE TABLE t", None);
        let insert = sql_tx(&key, "t:1", "INSERT INTO t VALUES id=1", Some(create.id));
        let update = sql_tx(&key, "t:1", "UPDATE t SET a=2 WHERE id=1", Some(insert.id));

        let mut b1 = Block::new(genesis.hash, 1, 0, vec![create.clone(), insert.clone()]);
        b1.hash = hash_bytes(b"b1");
        let mut b2 = Block::new(b1.hash, 2, 0, vec![update.clone()]);
        b2.hash = hash_bytes(b"b2");
        for b in [&b1, &b2] {
            blockchain.add_block(b).unwrap();
            index.block_added(b).unwrap();
            refs.block_added(b).unwrap();
        }
        assert_eq!(refs.get("t:1").unwrap(), Some(update.id));
        assert_eq!(refs.get("t:*").unwrap(), Some(create.id));

        refs.block_removed(&b2).unwrap();
        assert_eq!(refs.get("t:1").unwrap(), Some(insert.id));

        refs.block_removed(&b1).unwrap();
        assert_eq!(refs.get("t:1").unwrap(), None);
        assert_eq!(refs.get("t:*").unwrap(), None);

        assert_eq!(refs.reindex().unwrap(), 2);
        assert_eq!(refs.get("t:1").unwrap(), Some(update.id));
    }
}
