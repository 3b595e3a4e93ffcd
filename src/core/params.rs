/// Consensus-critical chain parameters.

use num_bigint::BigUint;

use crate::core::types::{Asset, Attribute, Block, Hash256, Header, Payload, Transaction, TxType, EMPTY_HASH};
use crate::crypto;
use crate::pow::auxpow::SideAuxPow;

/// Orphan blocks held before the pool evicts by expiration
pub const DEFAULT_MAX_ORPHAN_BLOCKS: usize = 10_000;

/// Block nodes kept in memory behind the best tip
pub const DEFAULT_MIN_MEMORY_NODES: u32 = 20_160;

/// Maximum entries in a block locator, genesis terminator included
pub const MAX_BLOCK_LOCATORS: usize = 500;

/// Window for the median-time-past calculation
pub const MEDIAN_TIME_BLOCKS: usize = 11;

/// Tolerance for block timestamps ahead of network-adjusted time (2 hours)
pub const MAX_TIME_OFFSET_SECONDS: u64 = 2 * 60 * 60;

/// Orphan blocks expire one hour after insertion
pub const ORPHAN_EXPIRATION_SECONDS: u64 = 60 * 60;

/// Target seconds between blocks
pub const TARGET_TIME_PER_BLOCK: u32 = 2 * 60;

/// Difficulty retarget window in seconds (one day)
pub const TARGET_TIMESPAN: u32 = 24 * 60 * 60;

/// Blocks between difficulty retargets
pub const BLOCKS_PER_RETARGET: u32 = TARGET_TIMESPAN / TARGET_TIME_PER_BLOCK;

/// Clamp factor for a single retarget step
pub const ADJUSTMENT_FACTOR: u32 = 4;

/// Maximum serialized block size in bytes
pub const MAX_BLOCK_SIZE: usize = 8_000_000;

/// Maximum transactions per block, coinbase included
pub const MAX_TX_IN_BLOCK: usize = 10_000;

/// Compact-bits encoding of the easiest allowed target
pub const POW_LIMIT_BITS: u32 = 0x1d03ffff;

/// Genesis header timestamp: 2018-06-30T12:00:00Z
pub const GENESIS_TIMESTAMP: u32 = 1_530_360_000;

pub const GENESIS_NONCE: u32 = 2_083_236_893;

pub const BLOCK_VERSION: u32 = 0;

/// The easiest target any block may use: 2^255 - 1
pub fn pow_limit() -> BigUint {
    (BigUint::from(1u8) << 255u32) - 1u8
}

/// Build the fixed genesis block: a single transaction registering the
/// native "ELA" asset with amount zero.
pub fn genesis_block() -> Block {
    let asset_tx = Transaction {
        tx_type: TxType::RegisterAsset,
        payload_version: 0,
        payload: Payload::RegisterAsset {
            asset: Asset {
                name: "ELA".to_string(),
                precision: 0x08,
                asset_type: 0x00,
            },
            amount: 0,
            controller: [0u8; 21],
        },
        attributes: Vec::<Attribute>::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        lock_time: 0,
        fee: 0,
        fee_per_kb: 0,
    };

    let mut block = Block {
        header: Header {
            version: BLOCK_VERSION,
            previous: EMPTY_HASH,
            merkle_root: EMPTY_HASH,
            timestamp: GENESIS_TIMESTAMP,
            bits: POW_LIMIT_BITS,
            nonce: GENESIS_NONCE,
            height: 0,
            side_aux_pow: SideAuxPow::default(),
        },
        transactions: vec![asset_tx],
    };

    let hashes: Vec<Hash256> = block.transactions.iter().map(|tx| tx.hash()).collect();
    block.header.merkle_root = crypto::merkle_root(&hashes);
    block
}

/// The native asset id is the hash of the genesis registration transaction.
pub fn genesis_asset_id() -> Hash256 {
    genesis_block().transactions[0].hash()
}
