//! Merged-mining proof of work. A side-chain block does not carry its own
//! nonce grind; instead a parent-chain block header commits to the side
//! block hash (through the side-chain-pow transaction under its merkle
//! root) and the parent header is what gets solved against the target.

use num_bigint::Sign;
use serde::{Deserialize, Serialize};

use crate::core::types::{Hash256, Payload, Transaction, EMPTY_HASH};
use crate::crypto;
use crate::pow::{compact_to_big, hash_to_big};

/// The parent-chain block header supplying the proof of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentHeader {
    pub version: u32,
    pub previous: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl ParentHeader {
    pub fn hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(80);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.previous);
        buf.extend_from_slice(&self.merkle_root);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        crypto::sha256d(&buf)
    }
}

/// The aux-pow attachment on a side-chain header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideAuxPow {
    /// Parent-chain transaction committing to the side block hash
    pub side_aux_block_tx: Transaction,
    pub parent_header: ParentHeader,
}

impl Default for SideAuxPow {
    fn default() -> Self {
        generate_side_aux_pow(EMPTY_HASH, EMPTY_HASH)
    }
}

/// Fake up the parent-chain commitment for a side block. The miner solves
/// the resulting parent header's nonce.
pub fn generate_side_aux_pow(side_block_hash: Hash256, side_genesis_hash: Hash256) -> SideAuxPow {
    let side_aux_block_tx = Transaction::new_side_chain_pow(side_block_hash, side_genesis_hash);
    let merkle_root = side_aux_block_tx.hash();
    SideAuxPow {
        side_aux_block_tx,
        parent_header: ParentHeader {
            version: 0,
            previous: EMPTY_HASH,
            merkle_root,
            timestamp: 0,
            bits: 0,
            nonce: 0,
        },
    }
}

impl SideAuxPow {
    /// Verify that this proof commits to `side_block_hash` and that the
    /// parent header satisfies the target encoded in `bits`.
    pub fn check(&self, side_block_hash: &Hash256, bits: u32) -> bool {
        let committed = match &self.side_aux_block_tx.payload {
            Payload::SideChainPow { side_block_hash: committed, .. } => committed == side_block_hash,
            _ => false,
        };
        if !committed {
            return false;
        }

        if self.parent_header.merkle_root != self.side_aux_block_tx.hash() {
            return false;
        }

        let target = compact_to_big(bits);
        if target.sign() != Sign::Plus {
            return false;
        }
        hash_to_big(&self.parent_header.hash()) <= target.to_biguint().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // target 0x207fffff covers roughly half the hash space, so a small
    // nonce sweep always lands a solution
    const EASY_BITS: u32 = 0x207fffff;

    fn solve(aux: &mut SideAuxPow, bits: u32) {
        let target = compact_to_big(bits).to_biguint().unwrap();
        for nonce in 0..=u32::MAX {
            aux.parent_header.nonce = nonce;
            if hash_to_big(&aux.parent_header.hash()) <= target {
                return;
            }
        }
        panic!("nonce space exhausted");
    }

    #[test]
    fn test_solved_aux_pow_checks() {
        let side_hash = [7u8; 32];
        let mut aux = generate_side_aux_pow(side_hash, [1u8; 32]);
        solve(&mut aux, EASY_BITS);
        assert!(aux.check(&side_hash, EASY_BITS));
    }

    #[test]
    fn test_wrong_side_hash_rejected() {
        let mut aux = generate_side_aux_pow([7u8; 32], [1u8; 32]);
        solve(&mut aux, EASY_BITS);
        assert!(!aux.check(&[8u8; 32], EASY_BITS));
    }

    #[test]
    fn test_tampered_commitment_rejected() {
        let side_hash = [7u8; 32];
        let mut aux = generate_side_aux_pow(side_hash, [1u8; 32]);
        solve(&mut aux, EASY_BITS);
        aux.parent_header.merkle_root = [0xABu8; 32];
        assert!(!aux.check(&side_hash, EASY_BITS));
    }

    #[test]
    fn test_invalid_bits_rejected() {
        let side_hash = [7u8; 32];
        let mut aux = generate_side_aux_pow(side_hash, [1u8; 32]);
        solve(&mut aux, EASY_BITS);
        // sign bit set: negative target can never be met
        assert!(!aux.check(&side_hash, 0x20ffffff));
    }
}
