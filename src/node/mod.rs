//! Node module - serialized chain updates, peer block ingest and background minting

mod context;
mod minting;

pub use context::*;
pub use minting::*;
