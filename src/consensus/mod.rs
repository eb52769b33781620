//! Consensus module - block structure, proof of work, block assembly and verification

mod block;
mod error;
mod minter;
pub mod pow;

pub use block::*;
pub use error::*;
pub use minter::*;
pub use pow::{target_bits, target_for_bits, transaction_limits, PowError, ProofOfWork};
