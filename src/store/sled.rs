use ::sled::{Batch, Db};
use std::path::Path;

use crate::core::types::{Block, Hash256, Header, Transaction};
use crate::store::{ChainStore, StoreError};

/// Key prefixes for the record types kept in sled
const PREFIX_BLOCK: &[u8] = b"blk:";
const PREFIX_HEADER: &[u8] = b"hdr:";
const PREFIX_HEIGHT: &[u8] = b"hgt:";
const PREFIX_TX: &[u8] = b"txn:";
const PREFIX_SPENT: &[u8] = b"spt:";
const META_CURRENT: &[u8] = b"meta:current";
const META_HEIGHT: &[u8] = b"meta:height";

/// Persistent [`ChainStore`] backed by a sled embedded database. All
/// multi-record updates go through `apply_batch`, so a save, rollback or
/// whole reorganization lands atomically.
pub struct SledStore {
    db: Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = ::sled::open(path).map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(SledStore { db })
    }

    pub fn has_chain_data(&self) -> bool {
        self.db.contains_key(META_CURRENT).unwrap_or(false)
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .db
            .get(key)
            .map_err(|e| StoreError::Db(e.to_string()))?
            .map(|v| v.to_vec()))
    }

    fn current_height(&self) -> Option<u32> {
        let bytes = self.db.get(META_HEIGHT).ok()??;
        Some(u32::from_le_bytes(bytes.as_ref().try_into().ok()?))
    }

    /// Stage one block append into `batch`. `next_height` is the height
    /// the main chain will have once everything staged so far is applied.
    fn stage_save(batch: &mut Batch, block: &Block, next_height: u32) -> Result<Hash256, StoreError> {
        if block.header.height != next_height {
            return Err(StoreError::OutOfOrder(format!(
                "save at height {} but next is {}",
                block.header.height, next_height
            )));
        }
        let hash = block.hash();
        let encoded = bincode::serialize(block).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let header = bincode::serialize(&block.header).map_err(|e| StoreError::Serialize(e.to_string()))?;
        batch.insert(prefixed_key(PREFIX_BLOCK, &hash), encoded);
        batch.insert(prefixed_key(PREFIX_HEADER, &hash), header);
        batch.insert(height_key(next_height), hash.as_slice());
        for tx in &block.transactions {
            batch.insert(prefixed_key(PREFIX_TX, &tx.hash()), &[] as &[u8]);
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                batch.insert(spent_key(&input.previous.tx_id, input.previous.index), &[] as &[u8]);
            }
        }
        batch.insert(META_CURRENT, hash.as_slice());
        batch.insert(META_HEIGHT, next_height.to_le_bytes().to_vec());
        Ok(hash)
    }

    /// Stage removal of the block at `height`, which must be the staged
    /// tip and match `hash`.
    fn stage_rollback(&self, batch: &mut Batch, hash: &Hash256, height: u32) -> Result<(), StoreError> {
        let stored = self.get_block_hash(height)?;
        if stored != *hash {
            return Err(StoreError::OutOfOrder(format!(
                "rollback of {} which is not the tip",
                hex::encode(hash)
            )));
        }
        let block = self.get_block(hash)?;
        batch.remove(prefixed_key(PREFIX_BLOCK, hash));
        batch.remove(prefixed_key(PREFIX_HEADER, hash));
        batch.remove(height_key(height));
        for tx in &block.transactions {
            batch.remove(prefixed_key(PREFIX_TX, &tx.hash()));
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                batch.remove(spent_key(&input.previous.tx_id, input.previous.index));
            }
        }
        if height == 0 {
            batch.remove(META_CURRENT);
            batch.remove(META_HEIGHT);
        } else {
            let parent = self.get_block_hash(height - 1)?;
            batch.insert(META_CURRENT, parent.as_slice());
            batch.insert(META_HEIGHT, (height - 1).to_le_bytes().to_vec());
        }
        Ok(())
    }

    fn apply(&self, batch: Batch) -> Result<(), StoreError> {
        self.db.apply_batch(batch).map_err(|e| StoreError::Db(e.to_string()))?;
        self.db.flush().map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(())
    }
}

impl ChainStore for SledStore {
    fn get_height(&self) -> u32 {
        self.current_height().unwrap_or(0)
    }

    fn get_current_block_hash(&self) -> Hash256 {
        match self.get_raw(META_CURRENT) {
            Ok(Some(bytes)) if bytes.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                hash
            }
            _ => Hash256::default(),
        }
    }

    fn get_block_hash(&self, height: u32) -> Result<Hash256, StoreError> {
        match self.get_raw(&height_key(height))? {
            Some(bytes) if bytes.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(hash)
            }
            Some(_) => Err(StoreError::Serialize("bad height index entry".into())),
            None => Err(StoreError::NotFound("block hash")),
        }
    }

    fn get_header(&self, hash: &Hash256) -> Result<Header, StoreError> {
        match self.get_raw(&prefixed_key(PREFIX_HEADER, hash))? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(|e| StoreError::Serialize(e.to_string())),
            None => Err(StoreError::NotFound("header")),
        }
    }

    fn get_block(&self, hash: &Hash256) -> Result<Block, StoreError> {
        match self.get_raw(&prefixed_key(PREFIX_BLOCK, hash))? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(|e| StoreError::Serialize(e.to_string())),
            None => Err(StoreError::NotFound("block")),
        }
    }

    fn save_block(&self, block: &Block) -> Result<(), StoreError> {
        let next = match self.current_height() {
            Some(height) => height + 1,
            None => 0,
        };
        let mut batch = Batch::default();
        Self::stage_save(&mut batch, block, next)?;
        self.apply(batch)
    }

    fn rollback_block(&self, hash: &Hash256) -> Result<(), StoreError> {
        let height = self.current_height().ok_or(StoreError::NotFound("chain tip"))?;
        let mut batch = Batch::default();
        self.stage_rollback(&mut batch, hash, height)?;
        self.apply(batch)
    }

    fn is_block_in_store(&self, hash: &Hash256) -> bool {
        // Block records are removed on rollback, so presence means main chain.
        self.db
            .contains_key(prefixed_key(PREFIX_BLOCK, hash))
            .unwrap_or(false)
    }

    fn is_double_spend(&self, tx: &Transaction) -> bool {
        tx.inputs.iter().any(|input| {
            self.db
                .contains_key(spent_key(&input.previous.tx_id, input.previous.index))
                .unwrap_or(false)
        })
    }

    fn is_duplicate_tx(&self, tx_id: &Hash256) -> bool {
        self.db
            .contains_key(prefixed_key(PREFIX_TX, tx_id))
            .unwrap_or(false)
    }

    fn commit_reorg(&self, detach: &[Hash256], attach: &[Block]) -> Result<(), StoreError> {
        let mut height = self.current_height().ok_or(StoreError::NotFound("chain tip"))?;
        let mut batch = Batch::default();
        for hash in detach {
            self.stage_rollback(&mut batch, hash, height)?;
            height = height.saturating_sub(1);
        }
        for block in attach {
            Self::stage_save(&mut batch, block, height + 1)?;
            height += 1;
        }
        self.apply(batch)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn prefixed_key(prefix: &[u8], data: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + data.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(data);
    key
}

fn height_key(height: u32) -> Vec<u8> {
    prefixed_key(PREFIX_HEIGHT, &height.to_be_bytes())
}

fn spent_key(tx_id: &Hash256, index: u16) -> Vec<u8> {
    let mut key = Vec::with_capacity(PREFIX_SPENT.len() + 34);
    key.extend_from_slice(PREFIX_SPENT);
    key.extend_from_slice(tx_id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::genesis_block;

    fn child_of(parent: &Block, height: u32) -> Block {
        let mut block = genesis_block();
        block.header.previous = parent.hash();
        block.header.height = height;
        block.header.timestamp = parent.header.timestamp + 120;
        block
    }

    #[test]
    fn test_save_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        assert!(!store.has_chain_data());

        let genesis = genesis_block();
        let b1 = child_of(&genesis, 1);
        store.save_block(&genesis).unwrap();
        store.save_block(&b1).unwrap();

        assert!(store.has_chain_data());
        assert_eq!(store.get_height(), 1);
        assert_eq!(store.get_current_block_hash(), b1.hash());
        assert_eq!(store.get_block(&genesis.hash()).unwrap(), genesis);
        assert_eq!(store.get_header(&b1.hash()).unwrap(), b1.header);
        assert!(store.is_duplicate_tx(&b1.transactions[0].hash()));
    }

    #[test]
    fn test_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        let genesis = genesis_block();
        let b1 = child_of(&genesis, 1);
        store.save_block(&genesis).unwrap();
        store.save_block(&b1).unwrap();

        assert!(store.rollback_block(&genesis.hash()).is_err());
        store.rollback_block(&b1.hash()).unwrap();
        assert_eq!(store.get_height(), 0);
        assert!(!store.is_block_in_store(&b1.hash()));
        assert_eq!(store.get_current_block_hash(), genesis.hash());
    }

    #[test]
    fn test_commit_reorg_swaps_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        let genesis = genesis_block();
        let a1 = child_of(&genesis, 1);
        let mut b1 = child_of(&genesis, 1);
        b1.header.timestamp += 60;
        let b2 = child_of(&b1, 2);
        store.save_block(&genesis).unwrap();
        store.save_block(&a1).unwrap();

        store
            .commit_reorg(&[a1.hash()], &[b1.clone(), b2.clone()])
            .unwrap();
        assert_eq!(store.get_height(), 2);
        assert_eq!(store.get_current_block_hash(), b2.hash());
        assert!(!store.is_block_in_store(&a1.hash()));
        assert!(store.is_block_in_store(&b1.hash()));
    }
}
