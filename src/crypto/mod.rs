use sha2::{Digest, Sha256};

use crate::core::types::{Hash256, EMPTY_HASH};

/// Double SHA-256, the hash used for transaction ids, header hashes and
/// merkle nodes.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// Compute the merkle root over a list of transaction hashes.
///
/// Odd levels duplicate their last entry. An empty list yields the zero
/// hash (only the genesis constructor ever sees that case).
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    if hashes.is_empty() {
        return EMPTY_HASH;
    }

    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 != 0 {
            let last = *level.last().unwrap();
            level.push(last);
        }

        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&pair[0]);
            combined[32..].copy_from_slice(&pair[1]);
            next.push(sha256d(&combined));
        }
        level = next;
    }

    level[0]
}
