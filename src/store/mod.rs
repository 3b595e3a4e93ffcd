//! Persistent main-chain store. The chain core only ever talks to the
//! [`ChainStore`] trait; the sled-backed implementation is the node
//! default and [`memory::MemoryStore`] backs tests.

pub mod memory;
pub mod sled;

use crate::core::types::{Block, Hash256, Header, Transaction};

pub trait ChainStore: Send + Sync {
    /// Height of the current main-chain tip.
    fn get_height(&self) -> u32;

    /// Hash of the current main-chain tip.
    fn get_current_block_hash(&self) -> Hash256;

    fn get_block_hash(&self, height: u32) -> Result<Hash256, StoreError>;

    fn get_header(&self, hash: &Hash256) -> Result<Header, StoreError>;

    fn get_block(&self, hash: &Hash256) -> Result<Block, StoreError>;

    /// Append a block to the main chain. The block's height must be the
    /// next main-chain height.
    fn save_block(&self, block: &Block) -> Result<(), StoreError>;

    /// Remove the main-chain tip. The hash must match the tip.
    fn rollback_block(&self, hash: &Hash256) -> Result<(), StoreError>;

    fn is_block_in_store(&self, hash: &Hash256) -> bool;

    fn is_double_spend(&self, tx: &Transaction) -> bool;

    fn is_duplicate_tx(&self, tx_id: &Hash256) -> bool;

    /// Apply a reorganization as one unit: roll back `detach` (tip first)
    /// and append `attach` (ancestor first).
    ///
    /// The default implementation applies the operations sequentially and
    /// is only crash-safe on stores with internal transactionality;
    /// implementations should override it with an atomic batch.
    fn commit_reorg(&self, detach: &[Hash256], attach: &[Block]) -> Result<(), StoreError> {
        for hash in detach {
            self.rollback_block(hash)?;
        }
        for block in attach {
            self.save_block(block)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(&'static str),
    OutOfOrder(String),
    Db(String),
    Serialize(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "{} not found", what),
            StoreError::OutOfOrder(msg) => write!(f, "out-of-order store operation: {}", msg),
            StoreError::Db(e) => write!(f, "database error: {}", e),
            StoreError::Serialize(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}
