use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::core::types::{Block, Hash256, Header, OutPoint, Transaction};
use crate::store::{ChainStore, StoreError};

/// In-memory [`ChainStore`]. Supports whole-store snapshots so tests can
/// assert that a reorganization leaves no residue behind.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default, Clone, PartialEq, Eq)]
struct Inner {
    blocks: HashMap<Hash256, Block>,
    /// Main chain ordered by height
    main: Vec<Hash256>,
    /// Transaction ids of every main-chain transaction
    tx_ids: HashSet<Hash256>,
    /// Outpoints spent by main-chain transactions
    spent: HashSet<OutPoint>,
}

/// Opaque copy of the full store state.
pub struct Snapshot(Inner);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.inner.lock().clone())
    }

    pub fn restore(&self, snapshot: Snapshot) {
        *self.inner.lock() = snapshot.0;
    }

    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        *self.inner.lock() == snapshot.0
    }
}

impl Inner {
    fn apply_save(&mut self, block: &Block) -> Result<(), StoreError> {
        let next_height = self.main.len() as u32;
        if block.header.height != next_height {
            return Err(StoreError::OutOfOrder(format!(
                "save at height {} but tip is {}",
                block.header.height,
                next_height as i64 - 1
            )));
        }
        let hash = block.hash();
        self.main.push(hash);
        for tx in &block.transactions {
            self.tx_ids.insert(tx.hash());
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                self.spent.insert(input.previous);
            }
        }
        self.blocks.insert(hash, block.clone());
        Ok(())
    }

    fn apply_rollback(&mut self, hash: &Hash256) -> Result<(), StoreError> {
        match self.main.last() {
            Some(tip) if tip == hash => {}
            _ => {
                return Err(StoreError::OutOfOrder(format!(
                    "rollback of {} which is not the tip",
                    hex::encode(hash)
                )))
            }
        }
        self.main.pop();
        let block = self.blocks.get(hash).unwrap().clone();
        for tx in &block.transactions {
            self.tx_ids.remove(&tx.hash());
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                self.spent.remove(&input.previous);
            }
        }
        Ok(())
    }

    fn in_main(&self, hash: &Hash256) -> bool {
        self.main.iter().any(|h| h == hash)
    }
}

impl ChainStore for MemoryStore {
    fn get_height(&self) -> u32 {
        let inner = self.inner.lock();
        (inner.main.len() as u32).saturating_sub(1)
    }

    fn get_current_block_hash(&self) -> Hash256 {
        let inner = self.inner.lock();
        inner.main.last().copied().unwrap_or_default()
    }

    fn get_block_hash(&self, height: u32) -> Result<Hash256, StoreError> {
        let inner = self.inner.lock();
        inner
            .main
            .get(height as usize)
            .copied()
            .ok_or(StoreError::NotFound("block hash"))
    }

    fn get_header(&self, hash: &Hash256) -> Result<Header, StoreError> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(hash)
            .map(|b| b.header.clone())
            .ok_or(StoreError::NotFound("header"))
    }

    fn get_block(&self, hash: &Hash256) -> Result<Block, StoreError> {
        let inner = self.inner.lock();
        inner.blocks.get(hash).cloned().ok_or(StoreError::NotFound("block"))
    }

    fn save_block(&self, block: &Block) -> Result<(), StoreError> {
        self.inner.lock().apply_save(block)
    }

    fn rollback_block(&self, hash: &Hash256) -> Result<(), StoreError> {
        self.inner.lock().apply_rollback(hash)
    }

    fn is_block_in_store(&self, hash: &Hash256) -> bool {
        self.inner.lock().in_main(hash)
    }

    fn is_double_spend(&self, tx: &Transaction) -> bool {
        let inner = self.inner.lock();
        tx.inputs.iter().any(|input| inner.spent.contains(&input.previous))
    }

    fn is_duplicate_tx(&self, tx_id: &Hash256) -> bool {
        self.inner.lock().tx_ids.contains(tx_id)
    }

    fn commit_reorg(&self, detach: &[Hash256], attach: &[Block]) -> Result<(), StoreError> {
        // All-or-nothing: stage the whole reorg on a copy and swap it in
        // only when every step succeeded.
        let mut inner = self.inner.lock();
        let mut staged = inner.clone();
        for hash in detach {
            staged.apply_rollback(hash)?;
        }
        for block in attach {
            staged.apply_save(block)?;
        }
        *inner = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::genesis_block;
    use crate::core::types::EMPTY_HASH;
    use crate::pow::auxpow::SideAuxPow;

    fn child_of(parent: &Block, height: u32) -> Block {
        let mut block = genesis_block();
        block.header.previous = parent.hash();
        block.header.height = height;
        block.header.timestamp = parent.header.timestamp + 120;
        block.header.side_aux_pow = SideAuxPow::default();
        block
    }

    #[test]
    fn test_save_and_lookup() {
        let store = MemoryStore::new();
        let genesis = genesis_block();
        store.save_block(&genesis).unwrap();
        assert_eq!(store.get_height(), 0);
        assert_eq!(store.get_current_block_hash(), genesis.hash());
        assert_eq!(store.get_block_hash(0).unwrap(), genesis.hash());
        assert!(store.is_block_in_store(&genesis.hash()));
        assert!(store.is_duplicate_tx(&genesis.transactions[0].hash()));
    }

    #[test]
    fn test_out_of_order_save_rejected() {
        let store = MemoryStore::new();
        let genesis = genesis_block();
        store.save_block(&genesis).unwrap();
        let skip = child_of(&genesis, 5);
        assert!(matches!(store.save_block(&skip), Err(StoreError::OutOfOrder(_))));
    }

    #[test]
    fn test_rollback_requires_tip() {
        let store = MemoryStore::new();
        let genesis = genesis_block();
        let b1 = child_of(&genesis, 1);
        store.save_block(&genesis).unwrap();
        store.save_block(&b1).unwrap();
        assert!(store.rollback_block(&genesis.hash()).is_err());
        store.rollback_block(&b1.hash()).unwrap();
        assert_eq!(store.get_height(), 0);
        assert!(!store.is_block_in_store(&b1.hash()));
    }

    #[test]
    fn test_commit_reorg_atomicity() {
        let store = MemoryStore::new();
        let genesis = genesis_block();
        let b1 = child_of(&genesis, 1);
        store.save_block(&genesis).unwrap();
        store.save_block(&b1).unwrap();
        let before = store.snapshot();

        // second attach is out of order, so nothing must be applied
        let bad = child_of(&b1, 9);
        let err = store.commit_reorg(&[b1.hash()], &[b1.clone(), bad]);
        assert!(err.is_err());
        assert!(store.matches(&before));
    }

    #[test]
    fn test_reorg_neutrality_under_snapshot() {
        let store = MemoryStore::new();
        let genesis = genesis_block();
        let b1 = child_of(&genesis, 1);
        let b2 = child_of(&b1, 2);
        store.save_block(&genesis).unwrap();
        store.save_block(&b1).unwrap();
        store.save_block(&b2).unwrap();
        let before = store.snapshot();

        // detach the suffix then attach it back: the store must be
        // byte-for-byte where it started
        store
            .commit_reorg(&[b2.hash(), b1.hash()], &[b1.clone(), b2.clone()])
            .unwrap();
        assert!(store.matches(&before));
    }

    #[test]
    fn test_empty_store_defaults() {
        let store = MemoryStore::new();
        assert_eq!(store.get_height(), 0);
        assert_eq!(store.get_current_block_hash(), EMPTY_HASH);
        assert!(store.get_block_hash(0).is_err());
    }
}
