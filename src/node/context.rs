//! Node context
//!
//! Owns the chain, the transactions manager and the minter, and serializes
//! the operations that must not interleave. Lock order is always
//! ingest -> block add -> pool.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::MintQueue;
use crate::blockchain::{AddState, Blockchain, BlockchainError};
use crate::config::ConsensusConfig;
use crate::consensus::{pow, Block, ConsensusError, Minter, PowError, PrepareState};
use crate::crypto::{Hash, PrivateKey, PubKeyHash};
use crate::storage::KvStore;
use crate::transactions::{TransactionsManager, TxError, TxFlags};
use crate::validation::{SqlExecutor, Transaction};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Blockchain(#[from] BlockchainError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Pow(#[from] PowError),
    #[error("Minter address is not provided")]
    NoMinterAddress,
    #[error("Node lock poisoned")]
    Poisoned,
}

/// Whether a block announced by a peer can be added
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    CanAdd,
    Exists,
    NoPrevExists,
}

/// Result of ingesting a full block from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Added(AddState),
    Exists,
    /// Parent unknown, the caller should request ancestors
    NoPrev,
    /// Failed verification and was not stored
    Rejected(String),
}

/// Counters reported to peers and operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeState {
    pub blocks: u64,
    pub unapproved: usize,
    pub unspent: usize,
}

#[derive(Default)]
struct NodeLocks {
    ingest: Mutex<()>,
    block_add: Mutex<()>,
    pool: Mutex<()>,
}

fn lock(m: &Mutex<()>) -> Result<MutexGuard<'_, ()>, NodeError> {
    m.lock().map_err(|_| NodeError::Poisoned)
}

#[derive(Clone)]
pub struct Node {
    blockchain: Blockchain,
    transactions: TransactionsManager,
    minter: Minter,
    minter_address: Option<PubKeyHash>,
    /// Key of the local user, used to re-sign its own SQL after a reorg
    signing_key: Option<PrivateKey>,
    locks: Arc<NodeLocks>,
    mint_queue: Option<MintQueue>,
}

impl Node {
    pub fn new(
        store: Arc<dyn KvStore>,
        executor: Arc<dyn SqlExecutor>,
        consensus: ConsensusConfig,
        minter_address: Option<PubKeyHash>,
    ) -> Self {
        let blockchain = Blockchain::new(store.clone());
        let transactions = TransactionsManager::new(store, blockchain.clone(), executor, consensus);
        let minter = Minter::new(
            blockchain.clone(),
            transactions.clone(),
            minter_address.unwrap_or_default(),
        );
        Self {
            blockchain,
            transactions,
            minter,
            minter_address,
            signing_key: None,
            locks: Arc::new(NodeLocks::default()),
            mint_queue: None,
        }
    }

    /// Post a mint hint after every accepted transaction
    pub fn with_mint_queue(mut self, queue: MintQueue) -> Self {
        self.mint_queue = Some(queue);
        self
    }

    pub fn with_signing_key(mut self, key: PrivateKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn transactions(&self) -> &TransactionsManager {
        &self.transactions
    }

    pub fn minter(&self) -> &Minter {
        &self.minter
    }

    /// Create, seal and store a genesis block paying `minter_address`.
    /// Returns `None` when the chain already exists.
    pub fn init_blockchain(&self, minter_address: &PubKeyHash) -> Result<Option<Hash>, NodeError> {
        let _block_add = lock(&self.locks.block_add)?;
        if !self.blockchain.is_empty()? {
            debug!("blockchain exists, genesis not created");
            return Ok(None);
        }
        let consensus = self.transactions.consensus();
        let coinbase = Transaction::coinbase(consensus.coins_for_block_made, *minter_address, 0);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut genesis = Block::new(Hash::zero(), 0, timestamp, vec![coinbase]);
        pow::seal(&mut genesis, &consensus.settings)?;
        self.store_genesis(&genesis)?;
        info!(hash = %genesis.hash, minter = %minter_address, "blockchain created");
        Ok(Some(genesis.hash))
    }

    /// Start from a genesis block produced by another node
    pub fn init_blockchain_from_genesis(&self, genesis: &Block) -> Result<(), NodeError> {
        let _block_add = lock(&self.locks.block_add)?;
        if !pow::validate(genesis, &self.transactions.consensus().settings)? {
            return Err(ConsensusError::InvalidHash.into());
        }
        self.store_genesis(genesis)
    }

    fn store_genesis(&self, genesis: &Block) -> Result<(), NodeError> {
        self.blockchain.create_genesis(genesis)?;
        self.transactions.block_added(genesis, true)?;
        Ok(())
    }

    /// Add a block built here or received from a peer, then bring the pool,
    /// indexes and SQL state in line with the resulting canonical branch
    pub fn add_block(&self, block: &Block) -> Result<AddState, NodeError> {
        let _block_add = lock(&self.locks.block_add)?;
        let _pool = lock(&self.locks.pool)?;

        let old_tip = self.blockchain.get_top_hash()?;
        let state = self.blockchain.add_block(block)?;
        if state.stored() {
            self.transactions
                .block_added(block, state == AddState::AddedToTop)?;
        }
        if state == AddState::AddedToParallelTop {
            self.switch_branch(&old_tip, &block.hash)?;
        }
        Ok(state)
    }

    fn switch_branch(&self, old_tip: &Hash, new_tip: &Hash) -> Result<(), NodeError> {
        let replacement = self.blockchain.get_branches_replacement(old_tip, new_tip)?;
        if replacement.is_empty() {
            return Ok(());
        }
        info!(
            undone = replacement.old_branch.len(),
            applied = replacement.new_branch.len(),
            "canonical branch replaced"
        );

        // pending work built on the old branch must not outlive it
        let old_txs: Vec<Transaction> = replacement
            .old_branch
            .iter()
            .flat_map(|block| block.transactions.iter().cloned())
            .collect();
        let dependent = self.transactions.cancel_pending_built_on(&old_txs)?;

        // undone blocks come tip first; prepend so the list ends up oldest first
        let mut canceled: Vec<Transaction> = Vec::new();
        for block in &replacement.old_branch {
            self.transactions.block_removed_from_primary_chain(block)?;
            let mut txs = block.transactions.clone();
            txs.append(&mut canceled);
            canceled = txs;
        }
        for block in &replacement.new_branch {
            self.transactions.block_added_to_primary_chain(block)?;
        }
        canceled.extend(dependent);
        self.repeat_transactions_from_canceled_blocks(&canceled)
    }

    /// Offer transactions of undone blocks to the pool again. Failures are expected.
    fn repeat_transactions_from_canceled_blocks(&self, txs: &[Transaction]) -> Result<(), NodeError> {
        for tx in txs.iter().filter(|tx| !tx.is_coinbase()) {
            if self.transactions.get_if_exists(&tx.id)?.is_some() {
                continue;
            }
            match self.minter.add_transaction_to_pool(tx, TxFlags::EXECUTE) {
                Ok(()) => {}
                Err(ConsensusError::Tx(TxError::SqlBaseDiffers { correct })) => self.repeat_resigned(tx, correct),
                Err(e) => debug!(tx = %tx.id, error = %e, "canceled transaction not repeated"),
            }
        }
        Ok(())
    }

    /// Rebase an own SQL transaction on the base the new branch expects
    fn repeat_resigned(&self, tx: &Transaction, correct: Option<Hash>) {
        let (Some(key), Some(sql)) = (&self.signing_key, &tx.sql) else {
            debug!(tx = %tx.id, "SQL base changed, transaction not repeated");
            return;
        };
        if tx.signer.as_ref() != Some(&key.public_key()) {
            debug!(tx = %tx.id, "SQL base changed on a foreign transaction, not repeated");
            return;
        }
        let resigned = Transaction::signed(key, tx.inputs.clone(), tx.outputs.clone(), Some(sql.clone().with_base(correct)));
        match self.minter.add_transaction_to_pool(&resigned, TxFlags::EXECUTE) {
            Ok(()) => info!(old = %tx.id, new = %resigned.id, "transaction re-signed on new SQL base"),
            Err(e) => debug!(tx = %tx.id, error = %e, "re-signed transaction not repeated"),
        }
    }

    /// Remove the tip. Its transactions go back to the pool.
    pub fn drop_block(&self) -> Result<Block, NodeError> {
        let _block_add = lock(&self.locks.block_add)?;
        let _pool = lock(&self.locks.pool)?;
        let block = self.blockchain.delete_block()?;
        self.transactions.block_removed(&block)?;
        info!(hash = %block.hash, height = block.height, "block dropped");
        Ok(block)
    }

    pub fn check_block_state(&self, hash: &Hash, prev_hash: &Hash) -> Result<BlockState, NodeError> {
        if self.blockchain.block_exists(hash)? {
            return Ok(BlockState::Exists);
        }
        if !self.blockchain.block_exists(prev_hash)? {
            return Ok(BlockState::NoPrevExists);
        }
        Ok(BlockState::CanAdd)
    }

    pub fn received_full_block_from_other_node(&self, block: &Block) -> Result<IngestOutcome, NodeError> {
        let _ingest = lock(&self.locks.ingest)?;
        debug!(hash = %block.hash, height = block.height, "received a new block");

        match self.check_block_state(&block.hash, &block.prev_hash)? {
            BlockState::Exists => return Ok(IngestOutcome::Exists),
            BlockState::NoPrevExists => return Ok(IngestOutcome::NoPrev),
            BlockState::CanAdd => {}
        }
        if let Err(e) = self.minter.verify_block(block, true) {
            warn!(hash = %block.hash, error = %e, "block rejected");
            return Ok(IngestOutcome::Rejected(e.to_string()));
        }
        Ok(IngestOutcome::Added(self.add_block(block)?))
    }

    /// Verify, execute and admit a transaction, then hint the minter
    pub fn received_new_transaction(&self, tx: &Transaction) -> Result<(), NodeError> {
        {
            let _pool = lock(&self.locks.pool)?;
            self.minter.add_transaction_to_pool(tx, TxFlags::EXECUTE)?;
        }
        if let Some(queue) = &self.mint_queue {
            queue.notify(Some(tx.id));
        }
        Ok(())
    }

    pub fn cancel_transaction(&self, tx_id: &Hash) -> Result<(), NodeError> {
        let _pool = lock(&self.locks.pool)?;
        self.transactions.cancel_transaction(tx_id, true)?;
        Ok(())
    }

    pub fn reindex_data(&self) -> Result<crate::transactions::ReindexCounts, NodeError> {
        let _block_add = lock(&self.locks.block_add)?;
        let _pool = lock(&self.locks.pool)?;
        Ok(self.transactions.reindex_data()?)
    }

    /// Prepare, seal and add a block if the pool has enough work.
    ///
    /// Blocks the calling thread for the whole nonce search. Returns the new
    /// block hash, or `None` when there was nothing to mint.
    pub fn try_to_make_block(&self, new_tx: Option<Hash>) -> Result<Option<Hash>, NodeError> {
        if self.minter_address.is_none() {
            return Err(NodeError::NoMinterAddress);
        }
        let state = {
            let _pool = lock(&self.locks.pool)?;
            self.minter.prepare_new_block()?
        };
        if state != PrepareState::Done {
            debug!(?state, ?new_tx, "not enough transactions to make a block");
            return Ok(None);
        }

        let block = self.minter.complete_block()?;
        let added = self.add_block(&block)?;
        debug!(hash = %block.hash, ?added, "minted block added");
        Ok(Some(block.hash))
    }

    pub fn get_node_state(&self) -> Result<NodeState, NodeError> {
        Ok(NodeState {
            blocks: self.blockchain.get_best_height()? + 1,
            unapproved: self.transactions.get_unapproved_count()?,
            unspent: self.transactions.get_unspent_count()?,
        })
    }
}
