//! Validation module - transactions and their SQL payloads

mod sql;
mod transaction;

pub use sql::*;
pub use transaction::*;
