//! Chain store: block records plus the canonical-branch link index
//!
//! The link index is a doubly-linked list of block hashes kept as fixed-width
//! `prev || next` records. A record may have at most one child; a branch that
//! is not canonical has no records at all.

use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use super::{KvStore, KvStoreExt, StoreError, Table};
use crate::consensus::Block;
use crate::crypto::{Hash, HASH_LEN};

/// Blocks-table key holding the current tip hash
pub const TOP_HASH_KEY: &[u8] = b"l";
/// Blocks-table key holding the genesis hash
pub const FIRST_HASH_KEY: &[u8] = b"f";

const LINK_LEN: usize = HASH_LEN * 2;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Hash is empty")]
    HashEmpty,
    #[error("Hash {0} is not found in the chain")]
    HashNotFound(Hash),
    #[error("Hash {0} already has a next block")]
    HashAlreadyHasNext(Hash),
    #[error("Only last hash can be removed, {0} has a next block")]
    NotTip(Hash),
    #[error("Chain link record of {0} is corrupt")]
    CorruptLink(Hash),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Position of a block in the canonical link index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    pub prev: Hash,
    pub next: Hash,
}

impl ChainLink {
    pub fn to_bytes(&self) -> [u8; LINK_LEN] {
        let mut bytes = [0u8; LINK_LEN];
        bytes[..HASH_LEN].copy_from_slice(&self.prev.0);
        bytes[HASH_LEN..].copy_from_slice(&self.next.0);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != LINK_LEN {
            return None;
        }
        Some(Self {
            prev: Hash::from_slice(&bytes[..HASH_LEN])?,
            next: Hash::from_slice(&bytes[HASH_LEN..])?,
        })
    }
}

/// Typed access to the blocks and chain tables
#[derive(Clone)]
pub struct ChainStore {
    store: Arc<dyn KvStore>,
}

impl ChainStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn put_block(&self, block: &Block) -> Result<(), ChainError> {
        self.store.put_encoded(Table::Blocks, &block.hash.0, block)?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        if hash.is_zero() {
            return Ok(None);
        }
        Ok(self.store.get_decoded(Table::Blocks, &hash.0)?)
    }

    pub fn block_exists(&self, hash: &Hash) -> Result<bool, ChainError> {
        if hash.is_zero() {
            return Ok(false);
        }
        Ok(self.store.exists(Table::Blocks, &hash.0)?)
    }

    pub fn delete_block(&self, hash: &Hash) -> Result<(), ChainError> {
        self.store.delete(Table::Blocks, &hash.0)?;
        Ok(())
    }

    fn get_marker(&self, key: &[u8]) -> Result<Hash, ChainError> {
        Ok(self
            .store
            .get(Table::Blocks, key)?
            .and_then(|bytes| Hash::from_slice(&bytes))
            .unwrap_or_default())
    }

    /// Current tip, zero when the store is empty
    pub fn top_hash(&self) -> Result<Hash, ChainError> {
        self.get_marker(TOP_HASH_KEY)
    }

    pub fn set_top_hash(&self, hash: &Hash) -> Result<(), ChainError> {
        self.store.put(Table::Blocks, TOP_HASH_KEY, &hash.0)?;
        Ok(())
    }

    /// Genesis hash, zero when the store is empty
    pub fn first_hash(&self) -> Result<Hash, ChainError> {
        self.get_marker(FIRST_HASH_KEY)
    }

    pub fn set_first_hash(&self, hash: &Hash) -> Result<(), ChainError> {
        self.store.put(Table::Blocks, FIRST_HASH_KEY, &hash.0)?;
        Ok(())
    }

    /// Link `hash` as the child of `prev` (`prev` zero for genesis)
    pub fn add_to_chain(&self, hash: &Hash, prev: &Hash) -> Result<(), ChainError> {
        if hash.is_zero() {
            return Err(ChainError::HashEmpty);
        }
        if !prev.is_zero() {
            let mut parent = self
                .get_location_in_chain(prev)?
                .ok_or(ChainError::HashNotFound(*prev))?;
            if !parent.next.is_zero() {
                return Err(ChainError::HashAlreadyHasNext(*prev));
            }
            parent.next = *hash;
            self.put_link(prev, &parent)?;
        }
        trace!(%hash, %prev, "add to chain");
        self.put_link(
            hash,
            &ChainLink {
                prev: *prev,
                next: Hash::zero(),
            },
        )
    }

    /// Unlink a branch tip and clear its parent's `next`
    pub fn remove_from_chain(&self, hash: &Hash) -> Result<(), ChainError> {
        let link = self
            .get_location_in_chain(hash)?
            .ok_or(ChainError::HashNotFound(*hash))?;
        if !link.next.is_zero() {
            return Err(ChainError::NotTip(*hash));
        }
        if !link.prev.is_zero() {
            if let Some(mut parent) = self.get_location_in_chain(&link.prev)? {
                parent.next = Hash::zero();
                self.put_link(&link.prev, &parent)?;
            }
        }
        trace!(%hash, "remove from chain");
        self.store.delete(Table::Chain, &hash.0)?;
        Ok(())
    }

    pub fn block_in_chain(&self, hash: &Hash) -> Result<bool, ChainError> {
        if hash.is_zero() {
            return Ok(false);
        }
        Ok(self.store.exists(Table::Chain, &hash.0)?)
    }

    pub fn get_location_in_chain(&self, hash: &Hash) -> Result<Option<ChainLink>, ChainError> {
        if hash.is_zero() {
            return Ok(None);
        }
        match self.store.get(Table::Chain, &hash.0)? {
            Some(bytes) => ChainLink::from_bytes(&bytes)
                .map(Some)
                .ok_or(ChainError::CorruptLink(*hash)),
            None => Ok(None),
        }
    }

    fn put_link(&self, hash: &Hash, link: &ChainLink) -> Result<(), ChainError> {
        self.store.put(Table::Chain, &hash.0, &link.to_bytes())?;
        Ok(())
    }

    pub fn truncate_chain(&self) -> Result<(), ChainError> {
        self.store.truncate(Table::Chain)?;
        Ok(())
    }
}
