use thiserror::Error;

use super::PowError;
use crate::blockchain::BlockchainError;
use crate::crypto::Hash;
use crate::transactions::TxError;

/// Block assembly and block verification errors
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("There is a block prepared already")]
    AlreadyPrepared,
    #[error("Block was not prepared")]
    NotPrepared,
    #[error("Block hash is not valid")]
    InvalidHash,
    #[error("Block height {got} does not follow its parent, expected {expected}")]
    BadHeight { expected: u64, got: u64 },
    #[error("Number of transactions is too low: {got} < {min}")]
    TooFewTransactions { got: usize, min: u64 },
    #[error("Number of transactions is too high: {got} > {max}")]
    TooManyTransactions { got: usize, max: u64 },
    #[error("2 coinbase transactions in the block")]
    DuplicateCoinbase,
    #[error("No coinbase transaction in the block")]
    MissingCoinbase,
    #[error("Transaction {tx} in a block is not valid: {source}")]
    InvalidTransaction {
        tx: Hash,
        #[source]
        source: TxError,
    },
    #[error("Not enough valid transactions: {got} < {min}")]
    NotEnoughValid { got: usize, min: u64 },
    #[error("Minter state lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Pow(#[from] PowError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Blockchain(#[from] BlockchainError),
}
