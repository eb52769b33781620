//! Pool of unapproved transactions
//!
//! Pending transactions live in their own table keyed by id. Conflicts are two
//! pending transactions spending the same output, or two SQL transactions
//! built on the same base for the same reference.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

use super::TxError;
use crate::consensus::Block;
use crate::crypto::{Hash, PubKeyHash};
use crate::storage::{KvStore, KvStoreExt, Table};
use crate::validation::{Transaction, TxInput, TxOutput};

#[derive(Clone)]
pub struct TransactionPool {
    store: Arc<dyn KvStore>,
}

impl TransactionPool {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, tx_id: &Hash) -> Result<Option<Transaction>, TxError> {
        Ok(self.store.get_decoded(Table::Pool, &tx_id.0)?)
    }

    pub fn exists(&self, tx_id: &Hash) -> Result<bool, TxError> {
        Ok(self.store.exists(Table::Pool, &tx_id.0)?)
    }

    pub fn count(&self) -> Result<usize, TxError> {
        Ok(self.store.count(Table::Pool)?)
    }

    /// Every pending transaction, oldest first
    pub fn all(&self) -> Result<Vec<Transaction>, TxError> {
        let mut txs = Vec::new();
        self.store.for_each(Table::Pool, &mut |_, value| {
            txs.push(bincode::deserialize::<Transaction>(value)?);
            Ok(true)
        })?;
        txs.sort_by(|a, b| (a.time, a.id).cmp(&(b.time, b.id)));
        Ok(txs)
    }

    /// Store a transaction that conflicts with nothing already pending
    pub fn add(&self, tx: &Transaction) -> Result<(), TxError> {
        if self.exists(&tx.id)? {
            return Err(TxError::AlreadyInPool(tx.id));
        }
        if let Some(other) = self.detect_conflicts_for_new(tx)? {
            return Err(TxError::PoolConflict(tx.id, other));
        }
        self.store.put_encoded(Table::Pool, &tx.id.0, tx)?;
        debug!(tx = %tx.id, "transaction added to pool");
        Ok(())
    }

    pub fn delete(&self, tx_id: &Hash) -> Result<(), TxError> {
        self.store.delete(Table::Pool, &tx_id.0)?;
        Ok(())
    }

    /// Remove everything a block confirmed
    pub fn delete_from_block(&self, block: &Block) -> Result<(), TxError> {
        for tx in &block.transactions {
            self.delete(&tx.id)?;
        }
        Ok(())
    }

    /// Put the transactions of an undone block back. Failures are logged and skipped.
    pub fn add_from_canceled(&self, txs: &[Transaction]) -> Result<(), TxError> {
        for tx in txs.iter().filter(|tx| !tx.is_coinbase()) {
            if let Err(e) = self.add(tx) {
                trace!(tx = %tx.id, error = %e, "canceled transaction not returned to pool");
            }
        }
        Ok(())
    }

    pub fn clean(&self) -> Result<(), TxError> {
        Ok(self.store.truncate(Table::Pool)?)
    }

    /// First pending transaction that conflicts with `tx`
    pub fn detect_conflicts_for_new(&self, tx: &Transaction) -> Result<Option<Hash>, TxError> {
        let pending = self.all()?;
        let consumed_bases: HashSet<Hash> = pending.iter().filter_map(|p| p.sql_base()).collect();

        for existing in pending.iter().filter(|p| p.id != tx.id) {
            let shares_input = !tx.is_coinbase()
                && tx
                    .inputs
                    .iter()
                    .any(|i| existing.inputs.contains(i));
            if shares_input {
                return Ok(Some(existing.id));
            }

            if let (Some(new_sql), Some(old_sql)) = (&tx.sql, &existing.sql) {
                // a pending tx that another pending tx builds on is part of a
                // chain, not a competitor
                if old_sql.base_tx.is_some()
                    && old_sql.base_tx == new_sql.base_tx
                    && old_sql.reference_id == new_sql.reference_id
                    && !consumed_bases.contains(&existing.id)
                {
                    return Ok(Some(existing.id));
                }
            }
        }
        Ok(None)
    }

    /// Split a candidate list into transactions that can share a block and
    /// the ones that reuse an output already taken by an earlier one
    pub fn detect_conflicts(&self, txs: Vec<Transaction>) -> (Vec<Transaction>, Vec<Transaction>) {
        let mut used: HashSet<TxInput> = HashSet::new();
        let mut good = Vec::new();
        let mut bad = Vec::new();
        for tx in txs {
            if tx.inputs.iter().any(|i| used.contains(i)) {
                bad.push(tx);
                continue;
            }
            used.extend(tx.inputs.iter().copied());
            good.push(tx);
        }
        (good, bad)
    }

    /// Resolve inputs that point at pending transactions.
    ///
    /// Every input must exist in the pool and no other pending transaction may
    /// already spend it.
    pub fn check_inputs_are_prepared(&self, tx: &Transaction, inputs: &[TxInput]) -> Result<Vec<TxOutput>, TxError> {
        let pending = self.all()?;
        let by_id: HashMap<Hash, &Transaction> = pending.iter().map(|p| (p.id, p)).collect();

        let mut resolved = Vec::with_capacity(inputs.len());
        for input in inputs {
            let source = by_id.get(&input.tx_id).ok_or(TxError::NoInput(input.tx_id))?;
            let output = source
                .outputs
                .get(input.out_index as usize)
                .ok_or(TxError::OutputOutOfRange {
                    tx_id: input.tx_id,
                    out_index: input.out_index,
                })?;
            let reused = pending
                .iter()
                .any(|p| p.id != tx.id && p.inputs.contains(input));
            if reused {
                return Err(TxError::DuplicateInput {
                    tx_id: input.tx_id,
                    out_index: input.out_index,
                });
            }
            resolved.push(output.clone());
        }
        Ok(resolved)
    }

    /// Resolve inputs against transactions placed earlier in the same block
    pub fn check_inputs_were_before(inputs: &[TxInput], prev_txs: &[Transaction]) -> Result<Vec<TxOutput>, TxError> {
        let mut seen: HashSet<TxInput> = HashSet::new();
        let mut resolved = Vec::with_capacity(inputs.len());
        for input in inputs {
            let spent_before = prev_txs
                .iter()
                .any(|p| !p.is_coinbase() && p.inputs.contains(input));
            if spent_before || !seen.insert(*input) {
                return Err(TxError::DuplicateInput {
                    tx_id: input.tx_id,
                    out_index: input.out_index,
                });
            }
            let source = prev_txs
                .iter()
                .find(|p| p.id == input.tx_id)
                .ok_or(TxError::NoInput(input.tx_id))?;
            let output = source
                .outputs
                .get(input.out_index as usize)
                .ok_or(TxError::OutputOutOfRange {
                    tx_id: input.tx_id,
                    out_index: input.out_index,
                })?;
            resolved.push(output.clone());
        }
        Ok(resolved)
    }

    /// Pending transaction to use as base for `reference_id` (or `alt`).
    ///
    /// A pending tx whose own id is already somebody's base is past history and
    /// is skipped for the primary reference.
    pub fn find_sql_reference_transaction(&self, reference_id: &str, alt: Option<&str>) -> Result<Option<Hash>, TxError> {
        let pending = self.all()?;
        let consumed_bases: HashSet<Hash> = pending.iter().filter_map(|p| p.sql_base()).collect();

        let mut primary = None;
        let mut alternative = None;
        for tx in &pending {
            let Some(reference) = tx.sql_reference() else {
                continue;
            };
            if reference == reference_id && !consumed_bases.contains(&tx.id) {
                primary = Some(tx.id);
            } else if alt == Some(reference) {
                alternative = Some(tx.id);
            }
        }
        Ok(primary.or(alternative))
    }

    /// Pending SQL transactions whose base is `tx_id`
    pub fn find_sql_based_on_transaction(&self, tx_id: &Hash) -> Result<Vec<Transaction>, TxError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|tx| tx.sql_base() == Some(*tx_id))
            .collect())
    }

    /// Pending transactions signed by `pkh`
    pub fn get_transactions_prepared_by(&self, pkh: &PubKeyHash) -> Result<Vec<Transaction>, TxError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|tx| tx.signer.as_ref().map(|k| k.pubkey_hash()) == Some(*pkh))
            .collect())
    }
}
