//! Transaction verification and pool admission errors

use thiserror::Error;

use crate::blockchain::BlockchainError;
use crate::config::ConfigError;
use crate::crypto::{Hash, PubKeyHash};
use crate::storage::StoreError;
use crate::validation::{SqlExecError, StatementKind, VerifyError};

#[derive(Debug, Error)]
pub enum TxError {
    /// An input's transaction is neither confirmed nor pending. Recoverable:
    /// the caller may fetch the missing transaction and retry.
    #[error("Input transaction {0} is not found")]
    NoInput(Hash),
    #[error("Output {out_index} of {tx_id} was already spent before")]
    AlreadySpent { tx_id: Hash, out_index: u32 },
    #[error("Duplicate usage of transaction output {tx_id}:{out_index}")]
    DuplicateInput { tx_id: Hash, out_index: u32 },
    #[error("Transaction {tx_id} has no output {out_index}")]
    OutputOutOfRange { tx_id: Hash, out_index: u32 },
    /// The declared base is stale. Carries the base the transaction should use now.
    #[error("Base SQL transaction differs, correct base is {correct:?}")]
    SqlBaseDiffers { correct: Option<Hash> },
    #[error("Base transaction can not be found for reference {0}")]
    NoBaseTransaction(String),
    #[error("Statement of kind {0:?} is not allowed by consensus rules")]
    NotAllowed(StatementKind),
    #[error("Transaction {0} conflicts with pending transaction {1}")]
    PoolConflict(Hash, Hash),
    #[error("Transaction {0} is already in the pool")]
    AlreadyInPool(Hash),
    #[error("Transaction {0} is not found in the pool")]
    NotInPool(Hash),
    #[error("Output to {0} is neither the paid transactions wallet nor the signer")]
    PaidOutputForeign(PubKeyHash),
    #[error("SQL statement costs {needed}, paid {paid}")]
    PaymentTooSmall { needed: u64, paid: u64 },
    #[error("Not enough funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("All transactions are invalid! Waiting for new ones...")]
    AllInvalid,
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Sql(#[from] SqlExecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blockchain(#[from] BlockchainError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TxError {
    /// Whether retrying after fetching missing data could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TxError::NoInput(_) | TxError::SqlBaseDiffers { .. })
    }
}
