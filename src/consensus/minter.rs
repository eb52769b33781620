//! Block assembly and block verification
//!
//! The minter picks valid pool transactions for the next block, appends the
//! coinbase, runs the proof of work and checks blocks received from others
//! against the branch they extend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

use super::{pow, transaction_limits, Block, ConsensusError};
use crate::blockchain::Blockchain;
use crate::config::PowSettings;
use crate::crypto::{Hash, PubKeyHash};
use crate::transactions::{TransactionsManager, TxError, TxFlags};
use crate::validation::Transaction;

/// Result of [`Minter::prepare_new_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareState {
    /// A block is prepared and waits for [`Minter::complete_block`]
    Done,
    /// Not enough valid pending transactions
    NoTransactions,
    /// Minting is paused
    NotGoodTime,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct Minter {
    blockchain: Blockchain,
    transactions: TransactionsManager,
    /// Receiver of block rewards
    minter: PubKeyHash,
    prepared: Arc<Mutex<Option<Block>>>,
    stop_signal: Arc<AtomicBool>,
}

impl Minter {
    pub fn new(blockchain: Blockchain, transactions: TransactionsManager, minter: PubKeyHash) -> Self {
        Self {
            blockchain,
            transactions,
            minter,
            prepared: Arc::new(Mutex::new(None)),
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    fn settings(&self) -> &PowSettings {
        &self.transactions.consensus().settings
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    /// Abort a running nonce search and pause minting
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.stop_signal.store(false, Ordering::SeqCst);
    }

    pub fn is_block_prepared(&self) -> Result<bool, ConsensusError> {
        Ok(self
            .prepared
            .lock()
            .map_err(|_| ConsensusError::Poisoned)?
            .is_some())
    }

    pub fn set_prepared_block(&self, block: Option<Block>) -> Result<(), ConsensusError> {
        *self.prepared.lock().map_err(|_| ConsensusError::Poisoned)? = block;
        Ok(())
    }

    /// Ids of the non-coinbase transactions in the prepared block
    pub fn prepared_transaction_ids(&self) -> Result<Vec<Hash>, ConsensusError> {
        let prepared = self.prepared.lock().map_err(|_| ConsensusError::Poisoned)?;
        let block = prepared.as_ref().ok_or(ConsensusError::NotPrepared)?;
        Ok(block.regular_transactions().map(|tx| tx.id).collect())
    }

    /// Minimum and maximum transaction count for the block after the tip
    fn next_block_limits(&self) -> Result<(u64, u64), ConsensusError> {
        let height = self.blockchain.get_best_height()? + 1;
        Ok(transaction_limits(self.settings(), height))
    }

    /// Select pool transactions for the next block
    pub fn prepare_new_block(&self) -> Result<PrepareState, ConsensusError> {
        if self.is_block_prepared()? {
            return Err(ConsensusError::AlreadyPrepared);
        }
        if self.stop_signal.load(Ordering::SeqCst) {
            return Ok(PrepareState::NotGoodTime);
        }

        let count = self.transactions.get_unapproved_count()? as u64;
        let (min, max) = self.next_block_limits()?;
        trace!(count, min, "minting: pending transactions");
        if count < min {
            return Ok(PrepareState::NoTransactions);
        }

        let txs = match self
            .transactions
            .get_unapproved_transactions_for_new_block(count.min(max) as usize)
        {
            Ok(txs) => txs,
            Err(TxError::AllInvalid) => {
                debug!("minting: all pending transactions were invalid");
                return Ok(PrepareState::NoTransactions);
            }
            Err(e) => return Err(e.into()),
        };
        if (txs.len() as u64) < min {
            return Err(ConsensusError::NotEnoughValid { got: txs.len(), min });
        }

        let block = self.make_block_from_transactions(txs)?;
        debug!(height = block.height, txs = block.transactions.len(), "minting: block prepared");
        self.set_prepared_block(Some(block))?;
        Ok(PrepareState::Done)
    }

    /// Unsealed block on the tip with the reward appended last
    fn make_block_from_transactions(&self, mut txs: Vec<Transaction>) -> Result<Block, ConsensusError> {
        let top = self.blockchain.get_top_block()?;
        let height = top.height + 1;
        txs.push(Transaction::coinbase(
            self.transactions.consensus().coins_for_block_made,
            self.minter,
            height,
        ));
        Ok(Block::new(top.hash, height, now_secs(), txs))
    }

    /// Run the proof of work on the prepared block.
    ///
    /// Blocks the calling thread for at least `minimum_block_building_time_secs`.
    pub fn complete_block(&self) -> Result<Block, ConsensusError> {
        let mut block = self
            .prepared
            .lock()
            .map_err(|_| ConsensusError::Poisoned)?
            .take()
            .ok_or(ConsensusError::NotPrepared)?;

        let started = Instant::now();
        pow::seal_until(&mut block, self.settings(), &self.stop_signal)?;

        let floor = Duration::from_secs(self.settings().minimum_block_building_time_secs);
        let elapsed = started.elapsed();
        if elapsed < floor {
            std::thread::sleep(floor - elapsed);
        }
        info!(hash = %block.hash, height = block.height, nonce = block.nonce, "block minted");
        Ok(block)
    }

    /// Verify a block against the branch ending at its `prev_hash`.
    ///
    /// With `skip_base_if_not_on_top`, SQL bases are only checked when the
    /// block extends the current tip.
    pub fn verify_block(&self, block: &Block, skip_base_if_not_on_top: bool) -> Result<(), ConsensusError> {
        if !pow::validate(block, self.settings())? {
            return Err(ConsensusError::InvalidHash);
        }
        trace!(hash = %block.hash, "block hash verified");

        let parent = self.blockchain.get_block(&block.prev_hash)?;
        if block.height != parent.height + 1 {
            return Err(ConsensusError::BadHeight {
                expected: parent.height + 1,
                got: block.height,
            });
        }

        let got = block.transactions.len().saturating_sub(1);
        let (min, max) = transaction_limits(self.settings(), block.height);
        if (got as u64) < min {
            return Err(ConsensusError::TooFewTransactions { got, min });
        }
        if got as u64 > max {
            return Err(ConsensusError::TooManyTransactions { got, max });
        }

        let mut flags = TxFlags::NONE;
        if skip_base_if_not_on_top && self.blockchain.get_top_hash()? != block.prev_hash {
            flags.skip_base_check = true;
        }

        let mut coinbase_seen = false;
        let mut prev: Vec<Transaction> = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            if tx.is_coinbase() {
                if coinbase_seen {
                    return Err(ConsensusError::DuplicateCoinbase);
                }
                coinbase_seen = true;
            }
            self.transactions
                .verify_transaction(tx, Some(&prev), &block.prev_hash, flags)
                .map_err(|source| ConsensusError::InvalidTransaction { tx: tx.id, source })?;
            prev.push(tx.clone());
        }
        if !coinbase_seen {
            return Err(ConsensusError::MissingCoinbase);
        }
        Ok(())
    }

    /// Verify and admit a transaction received from a client or a peer.
    /// A coinbase is silently ignored.
    pub fn add_transaction_to_pool(&self, tx: &Transaction, flags: TxFlags) -> Result<(), ConsensusError> {
        if tx.is_coinbase() {
            trace!(tx = %tx.id, "coinbase is not pooled");
            return Ok(());
        }
        self.transactions
            .verify_transaction(tx, None, &Hash::zero(), flags)?;
        self.transactions.add_new_transaction(tx, flags)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusConfig;
    use crate::crypto::PrivateKey;
    use crate::storage::{KvStore, MemoryStore};
    use crate::validation::{RecordingExecutor, SqlUpdate};

    fn easy() -> ConsensusConfig {
        ConsensusConfig {
            settings: PowSettings {
                complexity_bits: 2,
                complexity_bits_step2: 2,
                complexity_step_height: 1000,
                min_tx_per_block: 1,
                max_tx_per_block: 3,
                minimum_block_building_time_secs: 0,
                max_nonce: 1_000_000,
            },
            ..ConsensusConfig::default()
        }
    }

    fn minter() -> (Minter, TransactionsManager, PrivateKey) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let blockchain = Blockchain::new(store.clone());
        let config = easy();
        let manager = TransactionsManager::new(store, blockchain.clone(), Arc::new(RecordingExecutor::new()), config.clone());
        let key = PrivateKey::generate();
        let pkh = key.public_key().pubkey_hash();

        let mut genesis = Block::new(Hash::zero(), 0, 1, vec![Transaction::coinbase(10, pkh, 0)]);
        pow::seal(&mut genesis, &config.settings).unwrap();
        blockchain.create_genesis(&genesis).unwrap();
        manager.block_added(&genesis, true).unwrap();
        (Minter::new(blockchain, manager.clone(), pkh), manager, key)
    }

    fn create_table(key: &PrivateKey, name: &str) -> Transaction {
        let sql = SqlUpdate::new(format!("{name}:*"), format!("CREATE TABLE {name}"), format!("DROP TABLE {name}"));
        Transaction::signed(key, vec![], vec![], Some(sql))
    }

    fn sealed(minter: &Minter, txs: Vec<Transaction>) -> Block {
        let top = minter.blockchain.get_top_block().unwrap();
        let mut b = Block::new(top.hash, top.height + 1, 2, txs);
        pow::seal(&mut b, minter.settings()).unwrap();
        b
    }

    #[test]
    fn test_empty_pool_has_nothing_to_mint() {
        let (m, _, _) = minter();
        assert_eq!(m.prepare_new_block().unwrap(), PrepareState::NoTransactions);
        m.stop();
        assert_eq!(m.prepare_new_block().unwrap(), PrepareState::NotGoodTime);
    }

    #[test]
    fn test_prepare_complete_verify() {
        let (m, _, key) = minter();
        let create = create_table(&key, "t");
        m.add_transaction_to_pool(&create, TxFlags::EXECUTE).unwrap();

        assert_eq!(m.prepare_new_block().unwrap(), PrepareState::Done);
        assert!(matches!(m.prepare_new_block(), Err(ConsensusError::AlreadyPrepared)));
        assert_eq!(m.prepared_transaction_ids().unwrap(), vec![create.id]);

        let block = m.complete_block().unwrap();
        assert!(!m.is_block_prepared().unwrap());
        assert_eq!(block.height, 1);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[1].is_coinbase());
        m.verify_block(&block, false).unwrap();
    }

    #[test]
    fn test_tampered_block_fails_hash_check() {
        let (m, _, key) = minter();
        let cb = Transaction::coinbase(10, key.public_key().pubkey_hash(), 1);
        let mut block = sealed(&m, vec![create_table(&key, "t"), cb]);
        m.verify_block(&block, false).unwrap();

        block.prev_hash.0[0] ^= 1;
        assert!(matches!(m.verify_block(&block, false), Err(ConsensusError::InvalidHash)));
    }

    #[test]
    fn test_height_must_follow_parent() {
        let (m, _, key) = minter();
        let genesis = m.blockchain.get_top_block().unwrap();
        let cb = Transaction::coinbase(10, key.public_key().pubkey_hash(), 500);
        let mut far = Block::new(genesis.hash, 500, 2, vec![create_table(&key, "t"), cb]);
        pow::seal(&mut far, m.settings()).unwrap();
        assert!(matches!(
            m.verify_block(&far, false),
            Err(ConsensusError::BadHeight { expected: 1, got: 500 })
        ));
    }

    #[test]
    fn test_coinbase_rules() {
        let (m, _, key) = minter();
        let pkh = key.public_key().pubkey_hash();

        let missing = sealed(&m, vec![create_table(&key, "a"), create_table(&key, "b")]);
        assert!(matches!(m.verify_block(&missing, false), Err(ConsensusError::MissingCoinbase)));

        let cb = Transaction::coinbase(10, pkh, 1);
        let mut second = Transaction::coinbase(10, pkh, 1);
        second.extra.push(0);
        second.id = second.compute_id();
        let doubled = sealed(&m, vec![create_table(&key, "a"), cb, second]);
        assert!(matches!(m.verify_block(&doubled, false), Err(ConsensusError::DuplicateCoinbase)));

        let greedy = sealed(&m, vec![create_table(&key, "a"), Transaction::coinbase(11, pkh, 1)]);
        assert!(matches!(
            m.verify_block(&greedy, false),
            Err(ConsensusError::InvalidTransaction { .. })
        ));
    }

    #[test]
    fn test_transaction_count_limits() {
        let (m, _, key) = minter();
        let cb = Transaction::coinbase(10, key.public_key().pubkey_hash(), 1);
        let only_coinbase = sealed(&m, vec![cb.clone()]);
        assert!(matches!(
            m.verify_block(&only_coinbase, false),
            Err(ConsensusError::TooFewTransactions { got: 0, min: 1 })
        ));

        let crowded = sealed(
            &m,
            vec![
                create_table(&key, "a"),
                create_table(&key, "b"),
                create_table(&key, "c"),
                create_table(&key, "d"),
                cb,
            ],
        );
        assert!(matches!(
            m.verify_block(&crowded, false),
            Err(ConsensusError::TooManyTransactions { got: 4, max: 3 })
        ));
    }
}
