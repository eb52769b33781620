//! Proof-of-work engine
//!
//! Digest = SHA-256(prev_hash || merkle(transactions) || timestamp ||
//! complexity_bits || nonce). A block is sealed when the digest, read as a
//! big-endian 256-bit integer, is strictly below `1 << (256 - bits)`.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

use super::Block;
use crate::config::PowSettings;
use crate::crypto::Hash;

#[derive(Debug, Error)]
pub enum PowError {
    #[error("No nonce below {max_nonce} satisfies the target")]
    Exhausted { max_nonce: u64 },
    #[error("Nonce search was interrupted")]
    Interrupted,
    #[error("Can not serialize block transactions: {0}")]
    Codec(#[from] bincode::Error),
}

/// Difficulty in bits for a block at `height`
pub fn target_bits(settings: &PowSettings, height: u64) -> u32 {
    if height >= settings.complexity_step_height {
        settings.complexity_bits_step2
    } else {
        settings.complexity_bits
    }
}

/// Big-endian `1 << (256 - bits)`; `bits` is clamped to 1..=255
pub fn target_for_bits(bits: u32) -> [u8; 32] {
    let shift = 256 - bits.clamp(1, 255) as usize;
    let mut target = [0u8; 32];
    target[31 - shift / 8] = 1u8 << (shift % 8);
    target
}

/// Strict `hash < target` over big-endian bytes
fn below_target(hash: &Hash, target: &[u8; 32]) -> bool {
    hash.0 < *target
}

/// Minimum and maximum number of transactions (coinbase excluded) for a height
pub fn transaction_limits(settings: &PowSettings, height: u64) -> (u64, u64) {
    let min = height.clamp(1, settings.min_tx_per_block.max(1));
    (min, settings.max_tx_per_block)
}

/// Nonce search for one block
pub struct ProofOfWork<'a> {
    block: &'a Block,
    settings: &'a PowSettings,
    target: [u8; 32],
    merkle_root: Hash,
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block, settings: &'a PowSettings) -> Result<Self, PowError> {
        Ok(Self {
            block,
            settings,
            target: target_for_bits(target_bits(settings, block.height)),
            merkle_root: block.transactions_root()?,
        })
    }

    fn prepare_data(&self, nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 32 + 8 + 4 + 8);
        data.extend_from_slice(&self.block.prev_hash.0);
        data.extend_from_slice(&self.merkle_root.0);
        data.extend_from_slice(&self.block.timestamp.to_be_bytes());
        data.extend_from_slice(&self.settings.complexity_bits.to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    fn digest(&self, nonce: u64) -> Hash {
        Hash(Sha256::digest(self.prepare_data(nonce)).into())
    }

    /// Search nonces from 0 up to the configured ceiling
    pub fn run(&self) -> Result<(u64, Hash), PowError> {
        self.run_until(&AtomicBool::new(false))
    }

    /// Same as [`run`](Self::run) but gives up once `stop` is raised
    pub fn run_until(&self, stop: &AtomicBool) -> Result<(u64, Hash), PowError> {
        debug!(height = self.block.height, "mining block");
        for nonce in 0..=self.settings.max_nonce {
            if nonce % 4096 == 0 && stop.load(Ordering::SeqCst) {
                return Err(PowError::Interrupted);
            }
            let hash = self.digest(nonce);
            if below_target(&hash, &self.target) {
                trace!(nonce, %hash, "nonce found");
                return Ok((nonce, hash));
            }
        }
        Err(PowError::Exhausted {
            max_nonce: self.settings.max_nonce,
        })
    }

    /// Recompute with the stored nonce; the digest must hit the target and equal the block hash
    pub fn validate(&self) -> bool {
        let hash = self.digest(self.block.nonce);
        below_target(&hash, &self.target) && hash == self.block.hash
    }
}

/// Run the search and write `nonce` and `hash` into the block
pub fn seal(block: &mut Block, settings: &PowSettings) -> Result<(), PowError> {
    seal_until(block, settings, &AtomicBool::new(false))
}

pub fn seal_until(block: &mut Block, settings: &PowSettings, stop: &AtomicBool) -> Result<(), PowError> {
    let (nonce, hash) = ProofOfWork::new(block, settings)?.run_until(stop)?;
    block.nonce = nonce;
    block.hash = hash;
    Ok(())
}

/// Whether a sealed block carries a valid proof
pub fn validate(block: &Block, settings: &PowSettings) -> Result<bool, PowError> {
    Ok(ProofOfWork::new(block, settings)?.validate())
}
