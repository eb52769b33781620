//! Transaction structure and validation
//!
//! One shape covers every kind: a coinbase, a currency transfer, a pure SQL
//! update, or a currency transfer paying for an SQL update.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use super::SqlUpdate;
use crate::crypto::{hash_bytes, Hash, PrivateKey, PubKeyHash, PublicKey, SchnorrSignature};

/// Output index marking the single input of a coinbase
pub const COINBASE_OUT_INDEX: u32 = u32::MAX;

/// Reference to an output of an earlier transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxInput {
    pub tx_id: Hash,
    pub out_index: u32,
}

/// Currency output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in base units
    pub value: u64,
    /// Owner of the output
    pub dest: PubKeyHash,
}

/// Transaction verification failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Value of coinbase transaction is wrong")]
    CoinbaseValue,
    #[error("Coinbase transaction can have only 1 output and no SQL")]
    CoinbaseShape,
    #[error("Transaction ID does not match its contents")]
    BadId,
    #[error("Transaction is not signed")]
    MissingSignature,
    #[error("Signature does not match")]
    BadSignature,
    #[error("Expected {expected} resolved inputs, got {got}")]
    InputCount { expected: usize, got: usize },
    #[error("Input {0} is not owned by the signer")]
    InputOwner(usize),
    #[error("Too small output value")]
    ZeroOutput,
    #[error("Input and output values are not same: {inputs} vs {outputs}")]
    Unbalanced { inputs: u64, outputs: u64 },
    #[error("Transaction carries neither currency nor SQL")]
    Empty,
    #[error("Sum of values does not fit in 64 bits")]
    ValueOverflow,
}

/// Sum of output values, `None` on overflow
pub fn sum_values<'a>(outputs: impl IntoIterator<Item = &'a TxOutput>) -> Option<u64> {
    outputs
        .into_iter()
        .try_fold(0u64, |total, o| total.checked_add(o.value))
}

/// A complete transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// BLAKE3 of the signing bytes
    pub id: Hash,
    /// Creation time, unix nanoseconds
    pub time: u64,
    pub signer: Option<PublicKey>,
    pub signature: Option<SchnorrSignature>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub sql: Option<SqlUpdate>,
    /// Free-form data; a coinbase carries the block height here
    pub extra: Vec<u8>,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

impl Transaction {
    /// Unsigned transaction with a computed id
    pub fn new(
        signer: PublicKey,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        sql: Option<SqlUpdate>,
    ) -> Self {
        let mut tx = Self {
            id: Hash::zero(),
            time: now_nanos(),
            signer: Some(signer),
            signature: None,
            inputs,
            outputs,
            sql,
            extra: Vec::new(),
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Build and sign in one go
    pub fn signed(
        key: &PrivateKey,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        sql: Option<SqlUpdate>,
    ) -> Self {
        let mut tx = Self::new(key.public_key(), inputs, outputs, sql);
        tx.sign(key);
        tx
    }

    /// Mining reward for the block at `height`
    pub fn coinbase(reward: u64, dest: PubKeyHash, height: u64) -> Self {
        let mut tx = Self {
            id: Hash::zero(),
            time: now_nanos(),
            signer: None,
            signature: None,
            inputs: vec![TxInput {
                tx_id: Hash::zero(),
                out_index: COINBASE_OUT_INDEX,
            }],
            outputs: vec![TxOutput { value: reward, dest }],
            sql: None,
            extra: height.to_le_bytes().to_vec(),
        };
        tx.id = tx.compute_id();
        tx
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].tx_id.is_zero()
            && self.inputs[0].out_index == COINBASE_OUT_INDEX
    }

    pub fn is_sql(&self) -> bool {
        self.sql.is_some()
    }

    /// Spends currency (not a coinbase)
    pub fn is_currency_transfer(&self) -> bool {
        !self.inputs.is_empty() && !self.is_coinbase()
    }

    /// Declared base transaction of the SQL part
    pub fn sql_base(&self) -> Option<Hash> {
        self.sql.as_ref().and_then(|s| s.base_tx)
    }

    pub fn sql_reference(&self) -> Option<&str> {
        self.sql.as_ref().map(|s| s.reference_id.as_str())
    }

    /// Hash of the signing bytes
    pub fn compute_id(&self) -> Hash {
        hash_bytes(&self.to_bytes_for_signing())
    }

    pub fn sign(&mut self, key: &PrivateKey) {
        self.signer = Some(key.public_key());
        self.id = self.compute_id();
        self.signature = Some(key.sign(&self.id));
    }

    /// Everything except the id and the signature
    fn to_bytes_for_signing(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.time.to_le_bytes());
        bytes.extend_from_slice(&self.signer.as_ref().map(|k| k.0).unwrap_or_default());

        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            bytes.extend_from_slice(&input.tx_id.0);
            bytes.extend_from_slice(&input.out_index.to_le_bytes());
        }

        bytes.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            bytes.extend_from_slice(&output.value.to_le_bytes());
            bytes.extend_from_slice(&output.dest.0);
        }

        match &self.sql {
            Some(sql) => {
                bytes.push(1);
                bytes.extend_from_slice(&sql.to_bytes());
            }
            None => bytes.push(0),
        }

        bytes.extend_from_slice(&(self.extra.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.extra);
        bytes
    }

    /// Serialized form, used for Merkle leaves and storage
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// `None` when the outputs overflow `u64`
    pub fn total_output_value(&self) -> Option<u64> {
        sum_values(&self.outputs)
    }

    /// Check the transaction against the outputs its inputs spend.
    ///
    /// `spent[i]` must be the output referenced by `inputs[i]`.
    pub fn verify(&self, spent: &[TxOutput], block_reward: u64) -> Result<(), VerifyError> {
        if self.is_coinbase() {
            if self.outputs.len() != 1 || self.sql.is_some() {
                return Err(VerifyError::CoinbaseShape);
            }
            if self.outputs[0].value != block_reward {
                return Err(VerifyError::CoinbaseValue);
            }
            return Ok(());
        }

        if self.outputs.is_empty() && self.sql.is_none() {
            return Err(VerifyError::Empty);
        }
        if self.id != self.compute_id() {
            return Err(VerifyError::BadId);
        }
        let (Some(signer), Some(signature)) = (&self.signer, &self.signature) else {
            return Err(VerifyError::MissingSignature);
        };
        if !signer.verify(&self.id, signature) {
            return Err(VerifyError::BadSignature);
        }

        if spent.len() != self.inputs.len() {
            return Err(VerifyError::InputCount {
                expected: self.inputs.len(),
                got: spent.len(),
            });
        }
        let owner = signer.pubkey_hash();
        if let Some(index) = spent.iter().position(|out| out.dest != owner) {
            return Err(VerifyError::InputOwner(index));
        }
        if self.outputs.iter().any(|o| o.value == 0) {
            return Err(VerifyError::ZeroOutput);
        }

        if !self.inputs.is_empty() || !self.outputs.is_empty() {
            let inputs = sum_values(spent).ok_or(VerifyError::ValueOverflow)?;
            let outputs = self.total_output_value().ok_or(VerifyError::ValueOverflow)?;
            if inputs != outputs {
                return Err(VerifyError::Unbalanced { inputs, outputs });
            }
        }

        Ok(())
    }
}
