//! Merkle root over a block's transactions
//!
//! Feeds the proof-of-work preimage so that any change to the transaction list
//! changes the sealed digest.

use super::{hash_bytes, hash_pair, Hash};

/// Merkle root of a list of leaf hashes.
///
/// Empty list gives the zero hash; an odd level duplicates its last node.
pub fn compute_merkle_root(leaves: &[Hash]) -> Hash {
    let mut level: Vec<Hash> = match leaves {
        [] => return Hash::zero(),
        [single] => return *single,
        _ => leaves.to_vec(),
    };

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    level[0]
}

/// Merkle root of raw serialized items (each leaf is hashed first)
pub fn merkle_root_of<T: AsRef<[u8]>>(items: &[T]) -> Hash {
    let leaves: Vec<Hash> = items.iter().map(|i| hash_bytes(i.as_ref())).collect();
    compute_merkle_root(&leaves)
}
