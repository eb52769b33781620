//! Blockchain manager
//!
//! Appends and removes blocks, walks the canonical branch, and resolves forks.
//! Fork choice is by height only: a block higher than the current tip becomes
//! the new tip even if its branch was built under a lower difficulty.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::BlockIterator;
use crate::consensus::{Block, BlockShort};
use crate::crypto::Hash;
use crate::storage::{ChainError, ChainLink, ChainStore, KvStore, StoreError};
use crate::validation::Transaction;

/// Upper bound for [`Blockchain::get_next_blocks`]
pub const MAX_NEXT_BLOCKS: usize = 1000;

#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Blockchain is empty")]
    Empty,
    #[error("Block {0} is not found")]
    BlockNotFound(Hash),
    #[error("Genesis block has no side branch")]
    GenesisBranch,
    #[error("No connect between branches")]
    NoConnect,
    #[error("Blockchain already has a genesis block")]
    AlreadyInitialised,
    #[error("Block {hash} has height {got}, expected {expected}")]
    BadHeight { hash: Hash, expected: u64, got: u64 },
}

/// Outcome of [`Blockchain::add_block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddState {
    /// Block already stored, nothing done
    Exists,
    /// Parent unknown, caller must fetch ancestors first
    NoPrev,
    /// Appended on the current tip
    AddedToTop,
    /// New tip on another branch, the chain index was re-linked
    AddedToParallelTop,
    /// Stored but not canonical
    AddedToParallel,
}

impl AddState {
    /// Whether the block was stored by this call
    pub fn stored(self) -> bool {
        matches!(
            self,
            AddState::AddedToTop | AddState::AddedToParallelTop | AddState::AddedToParallel
        )
    }
}

/// Blocks reachable only from one of two tips
#[derive(Debug, Clone)]
pub struct SideBranch {
    /// From the side hash down to (excluding) the merge block, tip first
    pub side: Vec<Block>,
    /// From just above the merge block up to the main tip, oldest first
    pub main: Vec<Block>,
    pub merge: Block,
}

/// What a reorg must undo and apply
#[derive(Debug, Clone, Default)]
pub struct BranchReplacement {
    /// Blocks becoming canonical, oldest first
    pub new_branch: Vec<Block>,
    /// Blocks leaving the canonical branch, tip first (undo order)
    pub old_branch: Vec<Block>,
}

impl BranchReplacement {
    pub fn is_empty(&self) -> bool {
        self.new_branch.is_empty() && self.old_branch.is_empty()
    }
}

#[derive(Clone)]
pub struct Blockchain {
    chain: ChainStore,
}

impl Blockchain {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            chain: ChainStore::new(store),
        }
    }

    pub fn chain_store(&self) -> &ChainStore {
        &self.chain
    }

    /// Store the first block of an empty database
    pub fn create_genesis(&self, block: &Block) -> Result<(), BlockchainError> {
        if !self.chain.top_hash()?.is_zero() {
            return Err(BlockchainError::AlreadyInitialised);
        }
        self.chain.put_block(block)?;
        self.chain.add_to_chain(&block.hash, &Hash::zero())?;
        self.chain.set_first_hash(&block.hash)?;
        self.chain.set_top_hash(&block.hash)?;
        info!(hash = %block.hash, "genesis block stored");
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool, BlockchainError> {
        Ok(self.chain.top_hash()?.is_zero())
    }

    pub fn get_top_hash(&self) -> Result<Hash, BlockchainError> {
        Ok(self.chain.top_hash()?)
    }

    pub fn get_genesis_hash(&self) -> Result<Hash, BlockchainError> {
        Ok(self.chain.first_hash()?)
    }

    pub fn get_top_block(&self) -> Result<Block, BlockchainError> {
        let top = self.chain.top_hash()?;
        if top.is_zero() {
            return Err(BlockchainError::Empty);
        }
        self.get_block(&top)
    }

    pub fn get_best_height(&self) -> Result<u64, BlockchainError> {
        Ok(self.get_top_block()?.height)
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Block, BlockchainError> {
        self.chain
            .get_block(hash)?
            .ok_or(BlockchainError::BlockNotFound(*hash))
    }

    pub fn find_block(&self, hash: &Hash) -> Result<Option<Block>, BlockchainError> {
        Ok(self.chain.get_block(hash)?)
    }

    pub fn block_exists(&self, hash: &Hash) -> Result<bool, BlockchainError> {
        Ok(self.chain.block_exists(hash)?)
    }

    pub fn block_in_chain(&self, hash: &Hash) -> Result<bool, BlockchainError> {
        Ok(self.chain.block_in_chain(hash)?)
    }

    pub fn get_location_in_chain(&self, hash: &Hash) -> Result<Option<ChainLink>, BlockchainError> {
        Ok(self.chain.get_location_in_chain(hash)?)
    }

    /// Iterate from the current tip
    pub fn iter(&self) -> Result<BlockIterator<'_>, BlockchainError> {
        Ok(BlockIterator::new(&self.chain, self.chain.top_hash()?))
    }

    pub fn iter_from(&self, hash: Hash) -> BlockIterator<'_> {
        BlockIterator::new(&self.chain, hash)
    }

    /// Store a block and decide where it goes
    pub fn add_block(&self, block: &Block) -> Result<AddState, BlockchainError> {
        if self.chain.block_exists(&block.hash)? {
            return Ok(AddState::Exists);
        }
        let Some(parent) = self.chain.get_block(&block.prev_hash)? else {
            return Ok(AddState::NoPrev);
        };
        if block.height != parent.height + 1 {
            return Err(BlockchainError::BadHeight {
                hash: block.hash,
                expected: parent.height + 1,
                got: block.height,
            });
        }

        let top = self.get_top_block()?;
        self.chain.put_block(block)?;

        if block.height <= top.height {
            debug!(hash = %block.hash, height = block.height, "block added to parallel branch");
            return Ok(AddState::AddedToParallel);
        }

        let state = if block.prev_hash == top.hash {
            self.chain.add_to_chain(&block.hash, &block.prev_hash)?;
            AddState::AddedToTop
        } else {
            self.update_chain_on_new_branch(&block.hash, &top.hash)?;
            AddState::AddedToParallelTop
        };
        self.chain.set_top_hash(&block.hash)?;
        debug!(hash = %block.hash, height = block.height, ?state, "new tip");
        Ok(state)
    }

    /// Unlink the old branch down to the merge point and link the new one
    pub fn update_chain_on_new_branch(&self, new_tip: &Hash, old_tip: &Hash) -> Result<(), BlockchainError> {
        let mut to_link: Vec<BlockShort> = Vec::new();
        let mut merge = None;
        for block in self.iter_from(*new_tip) {
            let block = block?;
            if self.chain.block_in_chain(&block.hash)? {
                merge = Some(block.hash);
                break;
            }
            to_link.push(block.short());
        }
        let merge = merge.ok_or(BlockchainError::NoConnect)?;

        let mut current = *old_tip;
        while current != merge {
            let link = self
                .chain
                .get_location_in_chain(&current)?
                .ok_or(ChainError::HashNotFound(current))?;
            self.chain.remove_from_chain(&current)?;
            current = link.prev;
        }

        for short in to_link.iter().rev() {
            self.chain.add_to_chain(&short.hash, &short.prev_hash)?;
        }
        info!(%merge, linked = to_link.len(), "switched to new branch");
        Ok(())
    }

    /// Remove the tip. Returns the removed block.
    pub fn delete_block(&self) -> Result<Block, BlockchainError> {
        let block = self.get_top_block()?;
        self.chain.set_top_hash(&block.prev_hash)?;
        if block.is_genesis() {
            self.chain.set_first_hash(&Hash::zero())?;
        }
        self.chain.delete_block(&block.hash)?;
        self.chain.remove_from_chain(&block.hash)?;
        info!(hash = %block.hash, height = block.height, "block deleted");
        Ok(block)
    }

    /// Split two tips into the parts only reachable from each
    pub fn get_side_branch(&self, hash: &Hash, tip: &Hash) -> Result<SideBranch, BlockchainError> {
        let mut side_block = self.get_block(hash)?;
        let mut main_block = self.get_block(tip)?;
        if side_block.height < 1 {
            return Err(BlockchainError::GenesisBranch);
        }

        let mut side = Vec::new();
        let mut main = Vec::new();

        while side_block.height > main_block.height {
            let prev = side_block.prev_hash;
            side.push(side_block);
            side_block = self.get_block(&prev)?;
        }
        while main_block.height > side_block.height {
            let prev = main_block.prev_hash;
            main.push(main_block);
            main_block = self.get_block(&prev)?;
        }
        while side_block.hash != main_block.hash {
            if side_block.is_genesis() || main_block.is_genesis() {
                return Err(BlockchainError::NoConnect);
            }
            let (side_prev, main_prev) = (side_block.prev_hash, main_block.prev_hash);
            side.push(side_block);
            main.push(main_block);
            side_block = self.get_block(&side_prev)?;
            main_block = self.get_block(&main_prev)?;
        }

        main.reverse();
        Ok(SideBranch {
            side,
            main,
            merge: side_block,
        })
    }

    /// Blocks to undo (from `side_hash`) and apply (up to `tip`)
    pub fn get_branches_replacement(&self, side_hash: &Hash, tip: &Hash) -> Result<BranchReplacement, BlockchainError> {
        let branch = self.get_side_branch(side_hash, tip)?;
        if branch.merge.hash == *side_hash {
            return Ok(BranchReplacement::default());
        }
        Ok(BranchReplacement {
            new_branch: branch.main,
            old_branch: branch.side,
        })
    }

    /// Canonical block at `height`
    pub fn get_block_at_height(&self, height: u64) -> Result<Option<Block>, BlockchainError> {
        for block in self.iter()? {
            let block = block?;
            if block.height == height {
                return Ok(Some(block));
            }
            if block.height < height {
                break;
            }
        }
        Ok(None)
    }

    /// Up to `max_count` blocks walking backward from `start_from` (tip when zero)
    pub fn get_blocks_short_info(&self, start_from: &Hash, max_count: usize) -> Result<Vec<BlockShort>, BlockchainError> {
        let start = if start_from.is_zero() {
            self.chain.top_hash()?
        } else {
            *start_from
        };
        self.iter_from(start)
            .take(max_count)
            .map(|b| b.map(|b| b.short()))
            .collect()
    }

    /// Canonical blocks after `from`, oldest first
    pub fn get_next_blocks(&self, from: &Hash) -> Result<Vec<BlockShort>, BlockchainError> {
        let mut link = self
            .chain
            .get_location_in_chain(from)?
            .ok_or(ChainError::HashNotFound(*from))?;
        let mut out = Vec::new();
        while !link.next.is_zero() && out.len() < MAX_NEXT_BLOCKS {
            let next = link.next;
            out.push(self.get_block(&next)?.short());
            link = self
                .chain
                .get_location_in_chain(&next)?
                .ok_or(ChainError::HashNotFound(next))?;
        }
        Ok(out)
    }

    /// Up to `max_count` canonical blocks from genesis
    pub fn get_first_blocks(&self, max_count: usize) -> Result<Vec<Block>, BlockchainError> {
        let mut current = self.chain.first_hash()?;
        let mut out = Vec::new();
        while !current.is_zero() && out.len() < max_count {
            out.push(self.get_block(&current)?);
            current = self
                .chain
                .get_location_in_chain(&current)?
                .map(|l| l.next)
                .unwrap_or_default();
        }
        Ok(out)
    }

    pub fn get_transaction_from_block(&self, tx_id: &Hash, block_hash: &Hash) -> Result<Option<Transaction>, BlockchainError> {
        Ok(self
            .chain
            .get_block(block_hash)?
            .and_then(|b| b.find_transaction(tx_id).cloned()))
    }

    /// Pick which of several containing blocks is visible under `top`.
    ///
    /// A zero `top` means the canonical tip.
    pub fn choose_hash_under_tip(&self, hashes: &[Hash], top: &Hash) -> Result<Option<Hash>, BlockchainError> {
        if hashes.is_empty() {
            return Ok(None);
        }
        if top.is_zero() {
            for h in hashes {
                if self.chain.block_in_chain(h)? {
                    return Ok(Some(*h));
                }
            }
            return Ok(None);
        }
        if hashes.contains(top) {
            return Ok(Some(*top));
        }

        let mut top = *top;
        if !self.chain.block_in_chain(&top)? {
            let mut joined = false;
            for block in self.iter_from(top) {
                let block = block?;
                if hashes.contains(&block.hash) {
                    return Ok(Some(block.hash));
                }
                if self.chain.block_in_chain(&block.hash)? {
                    top = block.hash;
                    joined = true;
                    break;
                }
            }
            if !joined {
                return Ok(None);
            }
        }

        let top_height = self.get_block(&top)?.height;
        for h in hashes {
            if !self.chain.block_in_chain(h)? {
                continue;
            }
            if let Some(block) = self.chain.get_block(h)? {
                if block.height <= top_height {
                    return Ok(Some(*h));
                }
            }
        }
        Ok(None)
    }

    /// Whether `block` is canonical and between `bottom` and `top`.
    ///
    /// A `top` off the canonical branch is walked down until it joins it.
    pub fn check_block_is_in_range(&self, block: &Hash, bottom: &Hash, top: &Hash) -> Result<bool, BlockchainError> {
        let mut top = *top;
        if !top.is_zero() && !self.chain.block_in_chain(&top)? {
            let mut joined = false;
            for b in self.iter_from(top) {
                let b = b?;
                if b.hash == *block {
                    return Ok(true);
                }
                if b.hash == *bottom {
                    return Ok(false);
                }
                if self.chain.block_in_chain(&b.hash)? {
                    top = b.hash;
                    joined = true;
                    break;
                }
            }
            if !joined {
                return Ok(false);
            }
        }
        if top.is_zero() {
            top = self.chain.top_hash()?;
        }
        if !self.chain.block_in_chain(block)? {
            return Ok(false);
        }

        let height_of = |h: &Hash| -> Result<u64, BlockchainError> { Ok(self.get_block(h)?.height) };
        let bottom_height = if bottom.is_zero() { 0 } else { height_of(bottom)? };
        let block_height = height_of(block)?;
        let top_height = height_of(&top)?;
        Ok(bottom_height <= block_height && block_height <= top_height)
    }
}
