//! Storage module - key-value capability, sled and in-memory stores, chain store

mod chain;
mod kv;
mod memory;
mod sled_store;

pub use chain::*;
pub use kv::*;
pub use memory::*;
pub use sled_store::*;
