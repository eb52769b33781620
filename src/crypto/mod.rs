//! Cryptography module - BLAKE3 hashing, Schnorr signatures, Merkle roots, addresses

mod address;
mod hash;
mod merkle;
mod schnorr;

pub use address::*;
pub use hash::*;
pub use merkle::*;
pub use schnorr::*;
