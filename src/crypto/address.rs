//! Public key hashes and printable addresses
//!
//! Address = "SQ" + Base58(pkh[20] || checksum[4]), checksum being the first
//! four bytes of the double BLAKE3 of the key hash.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::{double_hash, hash_bytes, PublicKey};

/// Address prefix
pub const ADDRESS_PREFIX: &str = "SQ";

const PKH_LEN: usize = 20;
const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address must start with {ADDRESS_PREFIX}")]
    BadPrefix,
    #[error("Address is not valid base58")]
    BadEncoding,
    #[error("Address has wrong length")]
    BadLength,
    #[error("Address checksum mismatch")]
    BadChecksum,
}

/// 20-byte hash of a public key; owner of a currency output
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PubKeyHash(pub [u8; PKH_LEN]);

impl PubKeyHash {
    pub fn of_public_key(key: &PublicKey) -> Self {
        let digest = hash_bytes(&key.0);
        let mut pkh = [0u8; PKH_LEN];
        pkh.copy_from_slice(&digest.0[..PKH_LEN]);
        PubKeyHash(pkh)
    }

    pub fn to_address(&self) -> String {
        let mut payload = Vec::with_capacity(PKH_LEN + CHECKSUM_LEN);
        payload.extend_from_slice(&self.0);
        payload.extend_from_slice(&checksum(&self.0));
        format!("{}{}", ADDRESS_PREFIX, bs58::encode(payload).into_string())
    }

    pub fn from_address(address: &str) -> Result<Self, AddressError> {
        let encoded = address
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or(AddressError::BadPrefix)?;
        let payload = bs58::decode(encoded)
            .into_vec()
            .map_err(|_| AddressError::BadEncoding)?;
        if payload.len() != PKH_LEN + CHECKSUM_LEN {
            return Err(AddressError::BadLength);
        }
        let (pkh, sum) = payload.split_at(PKH_LEN);
        if checksum(pkh) != sum {
            return Err(AddressError::BadChecksum);
        }
        let mut out = [0u8; PKH_LEN];
        out.copy_from_slice(pkh);
        Ok(PubKeyHash(out))
    }
}

fn checksum(pkh: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = double_hash(pkh);
    let mut sum = [0u8; CHECKSUM_LEN];
    sum.copy_from_slice(&digest.0[..CHECKSUM_LEN]);
    sum
}

impl fmt::Debug for PubKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKeyHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for PubKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    #[test]
    fn test_address_roundtrip() {
        let pkh = PrivateKey::generate().public_key().pubkey_hash();
        let address = pkh.to_address();
        assert!(address.starts_with(ADDRESS_PREFIX));
        assert_eq!(PubKeyHash::from_address(&address), Ok(pkh));
    }

    #[test]
    fn test_bad_addresses() {
        assert_eq!(PubKeyHash::from_address("XX123"), Err(AddressError::BadPrefix));
        assert_eq!(PubKeyHash::from_address("SQ0OIl"), Err(AddressError::BadEncoding));
        assert_eq!(PubKeyHash::from_address("SQ2g"), Err(AddressError::BadLength));

        let mut address = PubKeyHash([9u8; 20]).to_address();
        let last = address.pop().unwrap();
        address.push(if last == '1' { '2' } else { '1' });
        assert_eq!(PubKeyHash::from_address(&address), Err(AddressError::BadChecksum));
    }
}
