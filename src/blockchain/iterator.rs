//! Walk blocks backward through `prev_hash`

use super::BlockchainError;
use crate::consensus::Block;
use crate::crypto::Hash;
use crate::storage::ChainStore;

/// Yields blocks from a starting hash down to genesis.
///
/// Follows stored `prev_hash` values, so it walks side branches too.
pub struct BlockIterator<'a> {
    chain: &'a ChainStore,
    current: Hash,
}

impl<'a> BlockIterator<'a> {
    pub fn new(chain: &'a ChainStore, start: Hash) -> Self {
        Self { chain, current: start }
    }

    /// Hash the next call will load
    pub fn current_hash(&self) -> Hash {
        self.current
    }
}

impl Iterator for BlockIterator<'_> {
    type Item = Result<Block, BlockchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_zero() {
            return None;
        }
        let hash = self.current;
        match self.chain.get_block(&hash) {
            Ok(Some(block)) => {
                self.current = block.prev_hash;
                Some(Ok(block))
            }
            Ok(None) => {
                self.current = Hash::zero();
                Some(Err(BlockchainError::BlockNotFound(hash)))
            }
            Err(e) => {
                self.current = Hash::zero();
                Some(Err(e.into()))
            }
        }
    }
}
