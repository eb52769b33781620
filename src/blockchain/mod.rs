//! Blockchain module - canonical chain management and fork resolution

mod iterator;
mod manager;

pub use iterator::*;
pub use manager::*;
