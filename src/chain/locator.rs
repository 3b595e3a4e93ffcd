//! Block locators: a thinned list of main-chain hashes a peer uses to find
//! the common ancestor with us, and the range query answering one.

use crate::chain::blocktree::BlockTree;
use crate::core::params::MAX_BLOCK_LOCATORS;
use crate::core::types::{Hash256, EMPTY_HASH};
use crate::store::{ChainStore, StoreError};

/// Build a locator starting at `hash`: the hash itself, ten single-step
/// ancestors, then exponentially spaced heights, terminated by genesis.
pub fn block_locator_from_hash(
    tree: &BlockTree,
    store: &dyn ChainStore,
    genesis_hash: &Hash256,
    hash: &Hash256,
) -> Vec<Hash256> {
    let mut locator = Vec::with_capacity(32);
    locator.push(*hash);

    if hash == genesis_hash {
        return locator;
    }

    // Height of the starting block: recent nodes come from the tree, the
    // rest from the store. An unknown hash yields the single-entry
    // locator for the block itself.
    let start_height = match tree.lookup(hash) {
        Some(id) => i64::from(tree.node(id).height),
        None => match store.get_block(hash) {
            Ok(block) => i64::from(block.header.height),
            Err(_) => return locator,
        },
    };

    let mut height = start_height;
    let mut increment: i64 = 1;
    while locator.len() < MAX_BLOCK_LOCATORS - 1 {
        // after ten recent entries, double the stride each step
        if locator.len() > 10 {
            increment *= 2;
        }
        height -= increment;
        if height < 1 {
            break;
        }

        match store.get_block_hash(height as u32) {
            Ok(hash) => locator.push(hash),
            Err(_) => {
                tracing::trace!("lookup of known valid height {} failed", height);
                continue;
            }
        }
    }

    locator.push(*genesis_hash);
    locator
}

/// First locator entry that exists in the store; zero when none do.
pub fn locate_start_block(store: &dyn ChainStore, locator: &[Hash256]) -> Hash256 {
    for hash in locator {
        if store.get_block(hash).is_ok() {
            return *hash;
        }
    }
    EMPTY_HASH
}

/// Hashes of main-chain blocks strictly after `start_hash`, up to
/// `stop_hash` or `max_hashes`, whichever cuts first. Zero hashes select
/// the open-ended variants.
pub fn locate_blocks(
    store: &dyn ChainStore,
    start_hash: &Hash256,
    stop_hash: &Hash256,
    max_hashes: u32,
) -> Result<Vec<Hash256>, StoreError> {
    let current_height = store.get_height();
    let mut start_height: u32 = 0;
    let count: u32;

    if *stop_hash == EMPTY_HASH {
        if *start_hash == EMPTY_HASH {
            count = current_height.min(max_hashes);
        } else {
            start_height = store.get_header(start_hash)?.height;
            count = (current_height - start_height).min(max_hashes);
        }
    } else {
        let stop_height = store.get_header(stop_hash)?.height;
        if *start_hash != EMPTY_HASH {
            start_height = store.get_header(start_hash)?.height;
            if stop_height < start_height {
                return Err(StoreError::NotFound("header to send"));
            }
            count = (stop_height - start_height).min(max_hashes);
        } else {
            count = stop_height.min(max_hashes);
        }
    }

    let mut hashes = Vec::with_capacity(count as usize);
    for i in 1..=count {
        hashes.push(store.get_block_hash(start_height + i)?);
    }
    Ok(hashes)
}
