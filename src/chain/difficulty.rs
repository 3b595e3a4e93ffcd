//! Difficulty retarget. Off the retarget boundary a block inherits its
//! parent's bits; on the boundary the target scales with the actual
//! timespan of the closing window, clamped to one quarter/four times the
//! ideal and capped at the proof-of-work limit.

use num_bigint::{BigInt, BigUint};

use crate::chain::blocktree::{BlockTree, NodeId};
use crate::core::params::{ADJUSTMENT_FACTOR, BLOCKS_PER_RETARGET, POW_LIMIT_BITS, TARGET_TIMESPAN};
use crate::pow::{big_to_compact, compact_to_big};

/// Required bits for the block following `prev`. A `None` parent means the
/// genesis block is being produced, which uses the limit.
pub fn calc_next_required_difficulty(
    tree: &BlockTree,
    prev: Option<NodeId>,
    pow_limit: &BigUint,
) -> u32 {
    let Some(prev_id) = prev else {
        return POW_LIMIT_BITS;
    };
    let prev_node = tree.node(prev_id);

    if (prev_node.height + 1) % BLOCKS_PER_RETARGET != 0 {
        return prev_node.bits;
    }

    // First block of the closing window.
    let mut first = prev_id;
    for _ in 0..BLOCKS_PER_RETARGET - 1 {
        match tree.node(first).parent {
            Some(parent) => first = parent,
            None => break,
        }
    }
    let first_node = tree.node(first);

    let actual_timespan = prev_node.timestamp.saturating_sub(first_node.timestamp);
    let clamped = actual_timespan.clamp(
        TARGET_TIMESPAN / ADJUSTMENT_FACTOR,
        TARGET_TIMESPAN * ADJUSTMENT_FACTOR,
    );

    let old_target = compact_to_big(prev_node.bits)
        .to_biguint()
        .unwrap_or_default();
    let mut new_target = old_target * clamped / TARGET_TIMESPAN;
    if new_target > *pow_limit {
        new_target = pow_limit.clone();
    }

    let bits = big_to_compact(&BigInt::from(new_target));
    tracing::debug!(
        "difficulty retarget at height {}: {:#010x} -> {:#010x} (actual timespan {}s)",
        prev_node.height + 1,
        prev_node.bits,
        bits,
        actual_timespan,
    );
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::pow_limit;
    use crate::core::types::{Hash256, Header, EMPTY_HASH};
    use crate::pow::auxpow::SideAuxPow;

    const START_BITS: u32 = 0x1d03ffff;

    /// Build a linear chain of `len` headers with the given block spacing.
    fn build_chain(tree: &mut BlockTree, len: u32, spacing: u32) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut prev: Hash256 = EMPTY_HASH;
        for height in 0..len {
            let header = Header {
                version: 0,
                previous: prev,
                merkle_root: [0u8; 32],
                timestamp: 1_530_360_000 + height * spacing,
                bits: START_BITS,
                nonce: 0,
                height,
                side_aux_pow: SideAuxPow::default(),
            };
            let hash = header.hash();
            ids.push(tree.load_node(&header, &hash).unwrap());
            prev = hash;
        }
        ids
    }

    #[test]
    fn test_genesis_uses_limit_bits() {
        let tree = BlockTree::new();
        assert_eq!(
            calc_next_required_difficulty(&tree, None, &pow_limit()),
            POW_LIMIT_BITS
        );
    }

    #[test]
    fn test_off_boundary_inherits_parent_bits() {
        let mut tree = BlockTree::new();
        let ids = build_chain(&mut tree, 10, 120);
        let bits = calc_next_required_difficulty(&tree, Some(ids[9]), &pow_limit());
        assert_eq!(bits, START_BITS);
    }

    #[test]
    fn test_fast_window_raises_difficulty() {
        let mut tree = BlockTree::new();
        // height of the last node is 719, so the next block retargets;
        // one-minute blocks make the window close in half the ideal time
        let ids = build_chain(&mut tree, BLOCKS_PER_RETARGET, 60);
        let prev = *ids.last().unwrap();
        let bits = calc_next_required_difficulty(&tree, Some(prev), &pow_limit());
        assert_ne!(bits, START_BITS);
        let old = compact_to_big(START_BITS).to_biguint().unwrap();
        let new = compact_to_big(bits).to_biguint().unwrap();
        assert!(new < old, "target must shrink after a fast window");
    }

    #[test]
    fn test_clamped_window() {
        let mut tree = BlockTree::new();
        // one-second blocks: the actual timespan clamps at timespan / 4
        let ids = build_chain(&mut tree, BLOCKS_PER_RETARGET, 1);
        let prev = *ids.last().unwrap();
        let bits = calc_next_required_difficulty(&tree, Some(prev), &pow_limit());

        let old = compact_to_big(START_BITS).to_biguint().unwrap();
        let quartered = old / 4u8;
        assert_eq!(bits, big_to_compact(&BigInt::from(quartered)));
    }

    #[test]
    fn test_capped_at_pow_limit() {
        let mut tree = BlockTree::new();
        // ten-minute blocks: the target would quadruple past the limit
        let ids = build_chain(&mut tree, BLOCKS_PER_RETARGET, 600);
        let prev = *ids.last().unwrap();
        // use the starting target itself as the limit to force the cap
        let limit = compact_to_big(START_BITS).to_biguint().unwrap();
        let bits = calc_next_required_difficulty(&tree, Some(prev), &limit);
        assert_eq!(bits, START_BITS);
    }
}
