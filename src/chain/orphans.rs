use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::params::ORPHAN_EXPIRATION_SECONDS;
use crate::core::types::{Block, Hash256};

pub struct OrphanBlock {
    pub block: Block,
    pub expiration: Instant,
    /// Monotonic insertion counter; breaks expiration ties so eviction is
    /// FIFO even when inserts land on the same instant
    seq: u64,
}

/// Blocks whose parent is not yet known, held until the parent arrives or
/// they expire. Expired entries are swept on each insert; there is no
/// background reaper.
pub struct OrphanPool {
    orphans: HashMap<Hash256, OrphanBlock>,
    /// parent hash -> orphans awaiting that parent
    prev_orphans: HashMap<Hash256, Vec<Hash256>>,
    next_seq: u64,
    max_orphans: usize,
}

impl OrphanPool {
    pub fn new(max_orphans: usize) -> Self {
        OrphanPool {
            orphans: HashMap::new(),
            prev_orphans: HashMap::new(),
            next_seq: 0,
            max_orphans,
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn is_known(&self, hash: &Hash256) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Park a block. Sweeps expired entries first and evicts the oldest
    /// orphan when the pool is full. Re-adding a known orphan is a no-op.
    pub fn add(&mut self, block: Block) {
        let hash = block.hash();
        if self.orphans.contains_key(&hash) {
            return;
        }

        let now = Instant::now();
        let expired: Vec<Hash256> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| now > orphan.expiration)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            self.remove(&hash);
        }

        if self.orphans.len() + 1 > self.max_orphans {
            let oldest = self
                .orphans
                .iter()
                .min_by_key(|(_, orphan)| (orphan.expiration, orphan.seq))
                .map(|(hash, _)| *hash);
            if let Some(oldest) = oldest {
                self.remove(&oldest);
            }
        }

        let prev_hash = block.header.previous;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.orphans.insert(
            hash,
            OrphanBlock {
                block,
                expiration: now + Duration::from_secs(ORPHAN_EXPIRATION_SECONDS),
                seq,
            },
        );
        self.prev_orphans.entry(prev_hash).or_default().push(hash);
    }

    /// Remove an orphan from both indices.
    pub fn remove(&mut self, hash: &Hash256) -> Option<OrphanBlock> {
        let orphan = self.orphans.remove(hash)?;
        let prev_hash = orphan.block.header.previous;
        if let Some(bucket) = self.prev_orphans.get_mut(&prev_hash) {
            bucket.retain(|entry| entry != hash);
            if bucket.is_empty() {
                self.prev_orphans.remove(&prev_hash);
            }
        }
        Some(orphan)
    }

    /// Take one orphan waiting on `parent`, if any.
    pub fn pop_child(&mut self, parent: &Hash256) -> Option<Block> {
        let hash = self.prev_orphans.get(parent)?.first().copied()?;
        self.remove(&hash).map(|orphan| orphan.block)
    }

    /// Walk the `previous` pointers back through the pool; the last orphan
    /// hash seen is the root of the orphan chain, which peer sync uses to
    /// request the missing ancestor.
    pub fn root_of(&self, hash: &Hash256) -> Hash256 {
        let mut root = *hash;
        let mut prev = *hash;
        while let Some(orphan) = self.orphans.get(&prev) {
            root = prev;
            prev = orphan.block.header.previous;
        }
        root
    }

    #[cfg(test)]
    fn force_expire(&mut self, hash: &Hash256) {
        if let Some(orphan) = self.orphans.get_mut(hash) {
            orphan.expiration = Instant::now() - Duration::from_secs(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::genesis_block;

    fn orphan_with_parent(parent: Hash256, tag: u8) -> Block {
        let mut block = genesis_block();
        block.header.previous = parent;
        block.header.height = 99;
        block.header.merkle_root = [tag; 32];
        block
    }

    #[test]
    fn test_add_and_lookup() {
        let mut pool = OrphanPool::new(10);
        let block = orphan_with_parent([1u8; 32], 1);
        let hash = block.hash();
        pool.add(block.clone());
        assert!(pool.is_known(&hash));
        assert_eq!(pool.len(), 1);

        // duplicate adds are idempotent
        pool.add(block);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_eviction_is_fifo() {
        let mut pool = OrphanPool::new(2);
        let o1 = orphan_with_parent([1u8; 32], 1);
        let o2 = orphan_with_parent([2u8; 32], 2);
        let o3 = orphan_with_parent([3u8; 32], 3);
        let h1 = o1.hash();
        let h2 = o2.hash();
        let h3 = o3.hash();

        pool.add(o1);
        pool.add(o2);
        pool.add(o3);

        assert_eq!(pool.len(), 2);
        assert!(!pool.is_known(&h1));
        assert!(pool.is_known(&h2));
        assert!(pool.is_known(&h3));
    }

    #[test]
    fn test_expired_entries_swept_on_add() {
        let mut pool = OrphanPool::new(10);
        let stale = orphan_with_parent([1u8; 32], 1);
        let stale_hash = stale.hash();
        pool.add(stale);
        pool.force_expire(&stale_hash);

        pool.add(orphan_with_parent([2u8; 32], 2));
        assert!(!pool.is_known(&stale_hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_pop_child_clears_both_indices() {
        let mut pool = OrphanPool::new(10);
        let parent = [7u8; 32];
        let block = orphan_with_parent(parent, 1);
        let hash = block.hash();
        pool.add(block);

        let popped = pool.pop_child(&parent).unwrap();
        assert_eq!(popped.hash(), hash);
        assert!(!pool.is_known(&hash));
        assert!(pool.pop_child(&parent).is_none());
    }

    #[test]
    fn test_root_of_walks_orphan_chain() {
        let mut pool = OrphanPool::new(10);
        let a = orphan_with_parent([1u8; 32], 1);
        let b = orphan_with_parent(a.hash(), 2);
        let c = orphan_with_parent(b.hash(), 3);
        let a_hash = a.hash();
        let c_hash = c.hash();
        pool.add(a);
        pool.add(b);
        pool.add(c);

        assert_eq!(pool.root_of(&c_hash), a_hash);
        // unknown hashes are their own root
        assert_eq!(pool.root_of(&[9u8; 32]), [9u8; 32]);
    }
}
