//! Block validation split the usual two ways: sanity checks that need no
//! chain position (header integrity, merkle root, proof of work, clock
//! skew) and contextual checks that do (required difficulty, median time
//! past, transaction finality).

use std::collections::HashSet;

use num_bigint::Sign;

use crate::chain::blocktree::{BlockTree, NodeId};
use crate::chain::difficulty::calc_next_required_difficulty;
use crate::chain::errors::ChainError;
use crate::chain::timesource::MedianTimeSource;
use crate::chain::Config;
use crate::core::params::{MAX_BLOCK_SIZE, MAX_TIME_OFFSET_SECONDS};
use crate::core::types::{is_finalized_transaction, Block};
use crate::pow::compact_to_big;

/// Context-independent checks. A block that fails here is discarded
/// without touching chain state.
pub fn check_block_sanity(
    block: &Block,
    config: &Config,
    time_source: &MedianTimeSource,
) -> Result<(), ChainError> {
    let header = &block.header;

    let target = compact_to_big(header.bits);
    if target.sign() != Sign::Plus {
        return Err(ChainError::SanityFailed("block target is not positive".into()));
    }
    let target = target.to_biguint().unwrap();
    if target > config.pow_limit {
        return Err(ChainError::SanityFailed("block target is above the proof-of-work limit".into()));
    }

    if !header.side_aux_pow.check(&header.hash(), header.bits) {
        return Err(ChainError::SanityFailed("invalid proof of work".into()));
    }

    let limit = time_source.adjusted_time() + MAX_TIME_OFFSET_SECONDS;
    if u64::from(header.timestamp) > limit {
        return Err(ChainError::SanityFailed("block timestamp too far in the future".into()));
    }

    if block.transactions.is_empty() {
        return Err(ChainError::SanityFailed("block has no transactions".into()));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ChainError::SanityFailed("first transaction is not the coinbase".into()));
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(ChainError::SanityFailed("block has more than one coinbase".into()));
    }

    if block.size() > MAX_BLOCK_SIZE {
        return Err(ChainError::SanityFailed("serialized block exceeds the maximum size".into()));
    }

    if !block.validate_merkle_root() {
        return Err(ChainError::InvalidMerkleRoot);
    }

    let mut seen = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        if !seen.insert(tx.hash()) {
            return Err(ChainError::SanityFailed("duplicate transaction in block".into()));
        }
        (config.check_tx_sanity)(tx).map_err(ChainError::SanityFailed)?;
    }

    Ok(())
}

/// Position-dependent checks against the previous node.
pub fn check_block_context(
    block: &Block,
    tree: &BlockTree,
    prev: Option<NodeId>,
    config: &Config,
) -> Result<(), ChainError> {
    let expected = calc_next_required_difficulty(tree, prev, &config.pow_limit);
    if block.header.bits != expected {
        return Err(ChainError::InvalidDifficulty {
            expected,
            got: block.header.bits,
        });
    }

    if let Some(prev_id) = prev {
        let median = tree.past_median_time(prev_id);
        if block.header.timestamp <= median {
            return Err(ChainError::ContextFailed(
                "block timestamp is not after the median time past".into(),
            ));
        }
    }

    for tx in &block.transactions {
        if !is_finalized_transaction(tx, block.header.height) {
            return Err(ChainError::ContextFailed("block contains a non-final transaction".into()));
        }
        (config.check_tx_context)(tx).map_err(ChainError::ContextFailed)?;
    }

    Ok(())
}
