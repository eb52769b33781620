//! UTXO set
//!
//! Persistent set of unspent currency outputs on the canonical branch, one record
//! per transaction holding whatever of its outputs are still unspent.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{TransactionIndex, TxError};
use crate::blockchain::Blockchain;
use crate::consensus::Block;
use crate::crypto::{Hash, PubKeyHash};
use crate::storage::{KvStore, KvStoreExt, Table};
use crate::validation::{Transaction, TxInput, TxOutput, VerifyError};

/// Unspent output with enough context to build an input from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub tx_id: Hash,
    pub out_index: u32,
    pub value: u64,
    pub dest: PubKeyHash,
    /// Signer of the creating transaction, `None` for a coinbase
    pub sender: Option<PubKeyHash>,
    pub is_coinbase: bool,
    /// Canonical block holding the creating transaction
    pub block_hash: Hash,
}

impl UnspentOutput {
    pub fn input(&self) -> TxInput {
        TxInput {
            tx_id: self.tx_id,
            out_index: self.out_index,
        }
    }

    pub fn output(&self) -> TxOutput {
        TxOutput {
            value: self.value,
            dest: self.dest,
        }
    }
}

fn outputs_of(tx: &Transaction, block_hash: Hash) -> Vec<UnspentOutput> {
    let sender = tx.signer.as_ref().map(|k| k.pubkey_hash());
    let is_coinbase = tx.is_coinbase();
    tx.outputs
        .iter()
        .enumerate()
        .map(|(i, o)| UnspentOutput {
            tx_id: tx.id,
            out_index: i as u32,
            value: o.value,
            dest: o.dest,
            sender,
            is_coinbase,
            block_hash,
        })
        .collect()
}

#[derive(Clone)]
pub struct UnspentOutputs {
    store: Arc<dyn KvStore>,
    blockchain: Blockchain,
    index: TransactionIndex,
}

impl UnspentOutputs {
    pub fn new(store: Arc<dyn KvStore>, blockchain: Blockchain, index: TransactionIndex) -> Self {
        Self { store, blockchain, index }
    }

    fn load(&self, tx_id: &Hash) -> Result<Vec<UnspentOutput>, TxError> {
        Ok(self
            .store
            .get_decoded(Table::Unspent, &tx_id.0)?
            .unwrap_or_default())
    }

    fn save(&self, tx_id: &Hash, outputs: &[UnspentOutput]) -> Result<(), TxError> {
        if outputs.is_empty() {
            self.store.delete(Table::Unspent, &tx_id.0)?;
        } else {
            self.store.put_encoded(Table::Unspent, &tx_id.0, &outputs)?;
        }
        Ok(())
    }

    /// Remove spent outputs and add new ones
    fn apply_transaction(&self, tx: &Transaction, block_hash: Hash) -> Result<(), TxError> {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let mut outputs = self.load(&input.tx_id)?;
                outputs.retain(|o| o.out_index != input.out_index);
                self.save(&input.tx_id, &outputs)?;
            }
        }
        self.save(&tx.id, &outputs_of(tx, block_hash))
    }

    /// Remove created outputs and restore the ones the inputs spent, as seen
    /// from `prev_hash`
    fn revert_transaction(&self, tx: &Transaction, prev_hash: &Hash) -> Result<(), TxError> {
        self.store.delete(Table::Unspent, &tx.id.0)?;
        if tx.is_coinbase() {
            return Ok(());
        }
        for input in &tx.inputs {
            let Some(info) = self
                .index
                .get_currency_transaction_all_info(&input.tx_id, prev_hash)?
            else {
                debug!(tx = %input.tx_id, "input transaction not visible, nothing to restore");
                continue;
            };
            let mut outputs = outputs_of(&info.tx, info.block_hash);
            outputs.retain(|o| !info.spent.iter().any(|s| s.out_index == o.out_index));
            self.save(&input.tx_id, &outputs)?;
        }
        Ok(())
    }

    pub fn block_added(&self, block: &Block) -> Result<(), TxError> {
        for tx in &block.transactions {
            self.apply_transaction(tx, block.hash)?;
        }
        Ok(())
    }

    /// Undo a block. Transactions are reverted newest first.
    pub fn block_removed(&self, block: &Block) -> Result<(), TxError> {
        for tx in block.transactions.iter().rev() {
            self.revert_transaction(tx, &block.prev_hash)?;
        }
        Ok(())
    }

    /// Rebuild from the canonical chain, genesis first. Returns the number of
    /// unspent records.
    pub fn reindex(&self) -> Result<usize, TxError> {
        self.store.truncate(Table::Unspent)?;
        let shorts = self.blockchain.get_blocks_short_info(&Hash::zero(), usize::MAX)?;
        for short in shorts.iter().rev() {
            let block = self.blockchain.get_block(&short.hash)?;
            self.block_added(&block)?;
        }
        self.count()
    }

    /// Number of transactions with at least one unspent output
    pub fn count(&self) -> Result<usize, TxError> {
        Ok(self.store.count(Table::Unspent)?)
    }

    pub fn get_output(&self, input: &TxInput) -> Result<Option<UnspentOutput>, TxError> {
        Ok(self
            .load(&input.tx_id)?
            .into_iter()
            .find(|o| o.out_index == input.out_index))
    }

    pub fn get_input_value(&self, input: &TxInput) -> Result<Option<u64>, TxError> {
        Ok(self.get_output(input)?.map(|o| o.value))
    }

    /// Visit every unspent output. Return `Ok(false)` to stop.
    pub fn for_each(&self, mut visit: impl FnMut(&UnspentOutput) -> Result<bool, TxError>) -> Result<(), TxError> {
        let mut outputs: Vec<UnspentOutput> = Vec::new();
        self.store.for_each(Table::Unspent, &mut |_, value| {
            let mut decoded: Vec<UnspentOutput> = bincode::deserialize(value)?;
            outputs.append(&mut decoded);
            Ok(true)
        })?;
        for output in &outputs {
            if !visit(output)? {
                break;
            }
        }
        Ok(())
    }

    pub fn outputs_of_address(&self, pkh: &PubKeyHash) -> Result<Vec<UnspentOutput>, TxError> {
        let mut found = Vec::new();
        self.for_each(|o| {
            if o.dest == *pkh {
                found.push(o.clone());
            }
            Ok(true)
        })?;
        Ok(found)
    }

    pub fn get_address_balance(&self, pkh: &PubKeyHash) -> Result<u64, TxError> {
        self.outputs_of_address(pkh)?
            .iter()
            .try_fold(0u64, |total, o| total.checked_add(o.value))
            .ok_or(TxError::Verify(VerifyError::ValueOverflow))
    }

    /// Collect outputs of `pkh` until `amount` is covered
    pub fn choose_spendable_outputs(&self, pkh: &PubKeyHash, amount: u64) -> Result<(Vec<UnspentOutput>, u64), TxError> {
        let mut outputs = self.outputs_of_address(pkh)?;
        outputs.sort_by(|a, b| (a.tx_id, a.out_index).cmp(&(b.tx_id, b.out_index)));

        let mut chosen = Vec::new();
        let mut total = 0u64;
        for output in outputs {
            if total >= amount {
                break;
            }
            total = total
                .checked_add(output.value)
                .ok_or(TxError::Verify(VerifyError::ValueOverflow))?;
            chosen.push(output);
        }
        if total < amount {
            return Err(TxError::InsufficientFunds {
                needed: amount,
                available: total,
            });
        }
        Ok((chosen, total))
    }
}
