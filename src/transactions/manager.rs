//! Transactions manager
//!
//! Ties the index, UTXO set, reference index and pool together. Verifies
//! transactions against a given tip, picks pool transactions for a new block,
//! and keeps every derived table and the SQL database in step with the
//! canonical branch while blocks are added, dropped or swapped by a reorg.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::{ReferenceIndex, TransactionIndex, TransactionPool, TxError, UnspentOutput, UnspentOutputs};
use crate::blockchain::{Blockchain, BlockchainError};
use crate::config::ConsensusConfig;
use crate::consensus::Block;
use crate::crypto::{Hash, PubKeyHash};
use crate::storage::KvStore;
use crate::validation::{sum_values, SqlExecutor, SqlUpdate, Transaction, TxInput, TxOutput, VerifyError};

/// Options for verifying and admitting a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxFlags {
    /// Run the SQL statement against the local database on admission
    pub execute_sql: bool,
    /// Do not compare the declared SQL base with the expected one
    pub skip_base_check: bool,
}

impl TxFlags {
    pub const NONE: TxFlags = TxFlags {
        execute_sql: false,
        skip_base_check: false,
    };

    pub const EXECUTE: TxFlags = TxFlags {
        execute_sql: true,
        skip_base_check: false,
    };
}

/// Sizes of the rebuilt tables after [`TransactionsManager::reindex_data`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReindexCounts {
    pub blocks: usize,
    pub unspent: usize,
    pub references: usize,
}

/// What to do with a raw query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPlan {
    /// The table is unmanaged, the query already ran locally
    Executed,
    /// The query must travel in a transaction carrying this update
    NeedsTransaction(SqlUpdate),
}

/// Balance of an address. Pending is the change the pool would make once
/// confirmed and may be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressBalance {
    pub approved: u64,
    pub pending: i64,
    pub total: i64,
}

#[derive(Clone)]
pub struct TransactionsManager {
    blockchain: Blockchain,
    index: TransactionIndex,
    utxo: UnspentOutputs,
    refs: ReferenceIndex,
    pool: TransactionPool,
    executor: Arc<dyn SqlExecutor>,
    consensus: ConsensusConfig,
}

impl TransactionsManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        blockchain: Blockchain,
        executor: Arc<dyn SqlExecutor>,
        consensus: ConsensusConfig,
    ) -> Self {
        let index = TransactionIndex::new(store.clone(), blockchain.clone());
        let utxo = UnspentOutputs::new(store.clone(), blockchain.clone(), index.clone());
        let refs = ReferenceIndex::new(store.clone(), blockchain.clone(), index.clone());
        let pool = TransactionPool::new(store);
        Self {
            blockchain,
            index,
            utxo,
            refs,
            pool,
            executor,
            consensus,
        }
    }

    pub fn index(&self) -> &TransactionIndex {
        &self.index
    }

    pub fn utxo(&self) -> &UnspentOutputs {
        &self.utxo
    }

    pub fn refs(&self) -> &ReferenceIndex {
        &self.refs
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    pub fn consensus(&self) -> &ConsensusConfig {
        &self.consensus
    }

    // ---- verification ------------------------------------------------------

    /// Verify `tx` as seen from `tip` (zero = canonical tip).
    ///
    /// With `prev_txs` the transaction sits inside a block after those
    /// transactions; inputs and SQL bases are then resolved from that list
    /// instead of the pool.
    pub fn verify_transaction(&self, tx: &Transaction, prev_txs: Option<&[Transaction]>, tip: &Hash, flags: TxFlags) -> Result<(), TxError> {
        if tx.is_coinbase() {
            tx.verify(&[], self.consensus.coins_for_block_made)?;
            return Ok(());
        }
        let height = match &tx.sql {
            Some(sql) => {
                let height = self.height_after(tip)?;
                if !self.consensus.allows(sql.kind(), sql.table(), height) {
                    return Err(TxError::NotAllowed(sql.kind()));
                }
                height
            }
            None => 0,
        };

        let spent = self.get_input_outputs(tx, prev_txs, tip)?;
        tx.verify(&spent, self.consensus.coins_for_block_made)?;

        if let Some(sql) = &tx.sql {
            self.check_sql_payment(tx, sql, height)?;
            if sql.requires_base() && !flags.skip_base_check {
                self.check_base_transaction(tx, sql, prev_txs)?;
            }
        }
        Ok(())
    }

    /// Height of a block built on `tip` (zero = canonical tip)
    fn height_after(&self, tip: &Hash) -> Result<u64, TxError> {
        if !tip.is_zero() {
            return Ok(self.blockchain.get_block(tip)?.height + 1);
        }
        match self.blockchain.get_best_height() {
            Ok(height) => Ok(height + 1),
            Err(BlockchainError::Empty) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// With a paid transactions wallet configured, currency of an SQL
    /// transaction may only go to that wallet or back to the signer, and the
    /// wallet must receive at least the statement price.
    fn check_sql_payment(&self, tx: &Transaction, sql: &SqlUpdate, height: u64) -> Result<(), TxError> {
        let Some(wallet) = self.consensus.paid_wallet()? else {
            return Ok(());
        };
        let signer = tx.signer.as_ref().map(|k| k.pubkey_hash());
        if let Some(foreign) = tx
            .outputs
            .iter()
            .find(|o| o.dest != wallet && Some(o.dest) != signer)
        {
            return Err(TxError::PaidOutputForeign(foreign.dest));
        }
        let needed = self.consensus.statement_price(sql.kind(), sql.table(), height);
        let paid = sum_values(tx.outputs.iter().filter(|o| o.dest == wallet)).ok_or(VerifyError::ValueOverflow)?;
        if paid < needed {
            return Err(TxError::PaymentTooSmall { needed, paid });
        }
        Ok(())
    }

    /// Outputs spent by each input, in input order
    fn get_input_outputs(&self, tx: &Transaction, prev_txs: Option<&[Transaction]>, tip: &Hash) -> Result<Vec<TxOutput>, TxError> {
        let mut seen = HashSet::new();
        let mut resolved: Vec<Option<TxOutput>> = Vec::with_capacity(tx.inputs.len());
        let mut missing: Vec<TxInput> = Vec::new();

        for input in &tx.inputs {
            if !seen.insert(*input) {
                return Err(TxError::DuplicateInput {
                    tx_id: input.tx_id,
                    out_index: input.out_index,
                });
            }
            let Some(info) = self.index.get_currency_transaction_all_info(&input.tx_id, tip)? else {
                missing.push(*input);
                resolved.push(None);
                continue;
            };
            if info.spent.iter().any(|s| s.out_index == input.out_index) {
                return Err(TxError::AlreadySpent {
                    tx_id: input.tx_id,
                    out_index: input.out_index,
                });
            }
            if let Some(prev) = prev_txs {
                if prev.iter().any(|p| !p.is_coinbase() && p.inputs.contains(input)) {
                    return Err(TxError::DuplicateInput {
                        tx_id: input.tx_id,
                        out_index: input.out_index,
                    });
                }
            }
            let output = info
                .tx
                .outputs
                .get(input.out_index as usize)
                .cloned()
                .ok_or(TxError::OutputOutOfRange {
                    tx_id: input.tx_id,
                    out_index: input.out_index,
                })?;
            resolved.push(Some(output));
        }

        if !missing.is_empty() {
            let mut found = match prev_txs {
                None => self.pool.check_inputs_are_prepared(tx, &missing)?,
                Some(prev) => TransactionPool::check_inputs_were_before(&missing, prev)?,
            }
            .into_iter();
            for slot in resolved.iter_mut().filter(|s| s.is_none()) {
                *slot = found.next();
            }
        }
        Ok(resolved.into_iter().flatten().collect())
    }

    fn check_base_transaction(&self, tx: &Transaction, sql: &SqlUpdate, prev_txs: Option<&[Transaction]>) -> Result<(), TxError> {
        let expected = match prev_txs {
            None => {
                // already admitted, its base was checked then
                if self.pool.exists(&tx.id)? {
                    return Ok(());
                }
                self.get_base_transaction(sql)?
            }
            Some(prev) => self.get_base_transaction_in_list(sql, prev)?,
        };
        match (sql.base_tx, expected) {
            (Some(declared), Some(expected)) if declared == expected => Ok(()),
            (_, correct) => Err(TxError::SqlBaseDiffers { correct }),
        }
    }

    /// Base for `sql` taking pending transactions into account
    pub fn get_base_transaction(&self, sql: &SqlUpdate) -> Result<Option<Hash>, TxError> {
        let alt = sql.alt_reference_id();
        if let Some(pending) = self
            .pool
            .find_sql_reference_transaction(&sql.reference_id, alt.as_deref())?
        {
            return Ok(Some(pending));
        }
        self.get_base_transaction_in_chain(sql)
    }

    /// Base for `sql` when it follows `prev` inside a block
    fn get_base_transaction_in_list(&self, sql: &SqlUpdate, prev: &[Transaction]) -> Result<Option<Hash>, TxError> {
        let last_with = |reference: &str| {
            prev.iter()
                .rev()
                .find(|p| p.sql_reference() == Some(reference))
                .map(|p| p.id)
        };
        if let Some(id) = last_with(&sql.reference_id) {
            return Ok(Some(id));
        }
        if let Some(id) = sql.alt_reference_id().and_then(|alt| last_with(&alt)) {
            return Ok(Some(id));
        }
        self.get_base_transaction_in_chain(sql)
    }

    fn get_base_transaction_in_chain(&self, sql: &SqlUpdate) -> Result<Option<Hash>, TxError> {
        if !sql.requires_base() {
            return Ok(None);
        }
        if let Some(id) = self.refs.get(&sql.reference_id)? {
            return Ok(Some(id));
        }
        if let Some(alt) = sql.alt_reference_id() {
            if let Some(id) = self.refs.get(&alt)? {
                return Ok(Some(id));
            }
        }
        Err(TxError::NoBaseTransaction(sql.reference_id.clone()))
    }

    /// Describe a raw query and attach the base it must declare
    pub fn prepare_sql_update(&self, query: &str) -> Result<SqlUpdate, TxError> {
        let description = self.executor.describe(query)?;
        let sql = SqlUpdate::new(description.reference_id, query, description.rollback_query);
        let base = if sql.requires_base() {
            self.get_base_transaction(&sql)?
        } else {
            None
        };
        Ok(sql.with_base(base))
    }

    /// Run queries on unmanaged tables directly, describe the rest
    pub fn prepare_query(&self, query: &str) -> Result<QueryPlan, TxError> {
        let description = self.executor.describe(query)?;
        let sql = SqlUpdate::new(description.reference_id, query, description.rollback_query);
        if self.consensus.is_unmanaged(sql.table()) {
            self.executor.execute(&sql)?;
            debug!(table = sql.table(), "query on unmanaged table executed");
            return Ok(QueryPlan::Executed);
        }
        Ok(QueryPlan::NeedsTransaction(self.prepare_sql_update(query)?))
    }

    // ---- pool --------------------------------------------------------------

    /// Admit an already verified transaction. The SQL part runs first when
    /// asked and is undone if the pool refuses the transaction.
    pub fn add_new_transaction(&self, tx: &Transaction, flags: TxFlags) -> Result<(), TxError> {
        let executed = match (&tx.sql, flags.execute_sql) {
            (Some(sql), true) => {
                self.executor.execute(sql)?;
                Some(sql)
            }
            _ => None,
        };
        if let Err(e) = self.pool.add(tx) {
            if let Some(sql) = executed {
                if let Err(rollback) = self.executor.rollback(sql) {
                    warn!(tx = %tx.id, error = %rollback, "rollback after refused admission failed");
                }
            }
            return Err(e);
        }
        info!(tx = %tx.id, sql = tx.is_sql(), "new transaction accepted");
        Ok(())
    }

    /// Remove a pending transaction and everything built on it, newest first
    pub fn cancel_transaction(&self, tx_id: &Hash, rollback: bool) -> Result<(), TxError> {
        let tx = self.pool.get(tx_id)?.ok_or(TxError::NotInPool(*tx_id))?;
        for dependent in self.pool.find_sql_based_on_transaction(tx_id)? {
            match self.cancel_transaction(&dependent.id, rollback) {
                Ok(()) | Err(TxError::NotInPool(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if rollback {
            if let Some(sql) = &tx.sql {
                self.executor.rollback(sql)?;
            }
        }
        self.pool.delete(tx_id)?;
        debug!(tx = %tx_id, rollback, "transaction canceled");
        Ok(())
    }

    /// Cancel pending transactions that build on `txs`, directly or through
    /// other pending ones, rolling their SQL back newest first. Returns them
    /// oldest first.
    pub fn cancel_pending_built_on(&self, txs: &[Transaction]) -> Result<Vec<Transaction>, TxError> {
        let pending = self.pool.all()?;
        let mut bases: HashSet<Hash> = txs.iter().map(|tx| tx.id).collect();
        let mut found: HashSet<Hash> = HashSet::new();
        loop {
            let before = found.len();
            for tx in &pending {
                if found.contains(&tx.id) {
                    continue;
                }
                let builds_on = tx.sql_base().is_some_and(|base| bases.contains(&base))
                    || tx.inputs.iter().any(|input| bases.contains(&input.tx_id));
                if builds_on {
                    bases.insert(tx.id);
                    found.insert(tx.id);
                }
            }
            if found.len() == before {
                break;
            }
        }

        let dependent: Vec<Transaction> = pending.into_iter().filter(|tx| found.contains(&tx.id)).collect();
        for tx in dependent.iter().rev() {
            if let Some(sql) = &tx.sql {
                self.executor.rollback(sql)?;
            }
            self.pool.delete(&tx.id)?;
            debug!(tx = %tx.id, "pending transaction built on an undone one canceled");
        }
        Ok(dependent)
    }

    /// Up to `count` pending transactions that are valid together on the
    /// current tip, oldest first. Invalid and conflicting ones are canceled.
    pub fn get_unapproved_transactions_for_new_block(&self, count: usize) -> Result<Vec<Transaction>, TxError> {
        let mut accepted: Vec<Transaction> = Vec::new();
        for tx in self.pool.all()? {
            if accepted.len() >= count {
                break;
            }
            // an earlier cancel may have cascaded to this one
            if !self.pool.exists(&tx.id)? {
                continue;
            }
            match self.verify_transaction(&tx, Some(&accepted), &Hash::zero(), TxFlags::NONE) {
                Ok(()) => accepted.push(tx),
                Err(e) => {
                    warn!(tx = %tx.id, error = %e, "pending transaction is invalid, canceling");
                    self.cancel_transaction(&tx.id, true)?;
                }
            }
        }
        if accepted.is_empty() {
            return Err(TxError::AllInvalid);
        }

        let (good, bad) = self.pool.detect_conflicts(accepted);
        for tx in bad {
            warn!(tx = %tx.id, "conflicting pending transaction, canceling");
            match self.cancel_transaction(&tx.id, true) {
                Ok(()) | Err(TxError::NotInPool(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(good)
    }

    fn rollback_conflicting_from_pool(&self, txs: &[Transaction]) -> Result<(), TxError> {
        for tx in txs.iter().filter(|tx| !tx.is_coinbase()) {
            while let Some(other) = self.pool.detect_conflicts_for_new(tx)? {
                info!(tx = %other, confirmed = %tx.id, "pending transaction lost to a confirmed one");
                self.cancel_transaction(&other, true)?;
            }
        }
        Ok(())
    }

    /// Apply SQL of confirmed transactions the pool had not executed yet
    fn transactions_from_added_block(&self, block: &Block) -> Result<(), TxError> {
        self.rollback_conflicting_from_pool(&block.transactions)?;
        for tx in &block.transactions {
            if let Some(sql) = &tx.sql {
                if !self.pool.exists(&tx.id)? {
                    self.executor.execute(sql)?;
                }
            }
        }
        Ok(())
    }

    // ---- chain events ------------------------------------------------------

    pub fn block_added(&self, block: &Block, on_top: bool) -> Result<(), TxError> {
        self.index.block_added(block)?;
        if on_top {
            self.block_added_to_primary_chain(block)?;
        }
        Ok(())
    }

    /// The tip was dropped: its transactions go back to the pool with their
    /// SQL left in place
    pub fn block_removed(&self, block: &Block) -> Result<(), TxError> {
        self.pool.add_from_canceled(&block.transactions)?;
        self.utxo.block_removed(block)?;
        self.index.block_removed(block)?;
        self.refs.block_removed(block)?;
        Ok(())
    }

    /// A stored block became canonical
    pub fn block_added_to_primary_chain(&self, block: &Block) -> Result<(), TxError> {
        self.transactions_from_added_block(block)?;
        self.pool.delete_from_block(block)?;
        self.utxo.block_added(block)?;
        self.refs.block_added(block)?;
        debug!(hash = %block.hash, height = block.height, "block applied");
        Ok(())
    }

    /// A block left the canonical branch but stays stored
    pub fn block_removed_from_primary_chain(&self, block: &Block) -> Result<(), TxError> {
        for tx in block.transactions.iter().rev() {
            if let Some(sql) = &tx.sql {
                self.executor.rollback(sql)?;
            }
        }
        self.utxo.block_removed(block)?;
        self.refs.block_removed(block)?;
        debug!(hash = %block.hash, height = block.height, "block unapplied");
        Ok(())
    }

    pub fn reindex_data(&self) -> Result<ReindexCounts, TxError> {
        let blocks = self.index.reindex()?;
        let unspent = self.utxo.reindex()?;
        let references = self.refs.reindex()?;
        info!(blocks, unspent, references, "transaction data reindexed");
        Ok(ReindexCounts {
            blocks,
            unspent,
            references,
        })
    }

    // ---- queries -----------------------------------------------------------

    /// Pending or canonical transaction
    pub fn get_if_exists(&self, tx_id: &Hash) -> Result<Option<Transaction>, TxError> {
        if let Some(tx) = self.pool.get(tx_id)? {
            return Ok(Some(tx));
        }
        Ok(self.index.get_transaction(tx_id, &Hash::zero())?.map(|(tx, _)| tx))
    }

    pub fn get_if_unapproved_exists(&self, tx_id: &Hash) -> Result<Option<Transaction>, TxError> {
        self.pool.get(tx_id)
    }

    pub fn get_unapproved_count(&self) -> Result<usize, TxError> {
        self.pool.count()
    }

    pub fn get_unspent_count(&self) -> Result<usize, TxError> {
        self.utxo.count()
    }

    pub fn for_each_unapproved_transaction(&self, mut visit: impl FnMut(&Transaction)) -> Result<usize, TxError> {
        let txs = self.pool.all()?;
        for tx in &txs {
            visit(tx);
        }
        Ok(txs.len())
    }

    pub fn for_each_unspent_output(&self, mut visit: impl FnMut(&UnspentOutput)) -> Result<(), TxError> {
        self.utxo.for_each(|o| {
            visit(o);
            Ok(true)
        })
    }

    pub fn clean_unapproved_cache(&self) -> Result<(), TxError> {
        trace!("pool truncated");
        self.pool.clean()
    }

    pub fn get_address_balance(&self, pkh: &PubKeyHash) -> Result<AddressBalance, TxError> {
        let approved = self.utxo.get_address_balance(pkh)?;
        let pending_txs = self.pool.all()?;

        let spent_in_pool: HashSet<TxInput> = pending_txs
            .iter()
            .flat_map(|tx| tx.inputs.iter().copied())
            .collect();
        let overflow = || TxError::Verify(VerifyError::ValueOverflow);
        let signed = |value: u64| i64::try_from(value).map_err(|_| overflow());
        let mut pending: i64 = 0;
        for tx in &pending_txs {
            for (i, output) in tx.outputs.iter().enumerate() {
                let input = TxInput {
                    tx_id: tx.id,
                    out_index: i as u32,
                };
                if output.dest == *pkh && !spent_in_pool.contains(&input) {
                    pending = pending.checked_add(signed(output.value)?).ok_or_else(overflow)?;
                }
            }
        }
        for tx in self.pool.get_transactions_prepared_by(pkh)? {
            for input in &tx.inputs {
                if let Some(value) = self.utxo.get_input_value(input)? {
                    pending = pending.checked_sub(signed(value)?).ok_or_else(overflow)?;
                }
            }
        }
        Ok(AddressBalance {
            approved,
            pending,
            total: signed(approved)?.checked_add(pending).ok_or_else(overflow)?,
        })
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }
}
