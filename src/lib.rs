//! SQLChain Core Library
//!
//! Ledger and consensus core for a blockchain whose transactions carry
//! currency transfers and SQL updates. Blocks are sealed with proof of work,
//! the canonical chain is the highest one, and SQL effects follow it through
//! reorganizations.

pub mod blockchain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod node;
pub mod storage;
pub mod transactions;
pub mod validation;
