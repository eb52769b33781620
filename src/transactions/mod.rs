//! Transactions module - index, UTXO set, references, pool and their manager

mod error;
mod index;
mod manager;
mod pool;
mod refs;
mod unspent;

pub use error::*;
pub use index::*;
pub use manager::*;
pub use pool::*;
pub use refs::*;
pub use unspent::*;
