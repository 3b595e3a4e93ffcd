use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto;
use crate::pow::auxpow::SideAuxPow;

/// A 32-byte hash used throughout the system
pub type Hash256 = [u8; 32];

/// Zero hash, used as the genesis block's previous-hash sentinel
pub const EMPTY_HASH: Hash256 = [0u8; 32];

/// A 21-byte program hash identifying a payment destination
pub type ProgramHash = [u8; 21];

/// Fixed-point coin amount with 8 decimal places
pub type Fixed64 = i64;

// ─── Transaction Types ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxType {
    CoinBase = 0x00,
    RegisterAsset = 0x01,
    TransferAsset = 0x02,
    SideChainPow = 0x05,
}

/// Asset definition carried by a RegisterAsset payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub precision: u8,
    pub asset_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    CoinBase {
        data: Vec<u8>,
    },
    RegisterAsset {
        asset: Asset,
        amount: Fixed64,
        controller: ProgramHash,
    },
    TransferAsset,
    /// Commits a side-chain block hash into a main-chain transaction; the
    /// hash ends up under the aux-pow parent header's merkle root.
    SideChainPow {
        side_block_hash: Hash256,
        side_genesis_hash: Hash256,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AttributeUsage {
    Nonce = 0x00,
    Description = 0x81,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub usage: AttributeUsage,
    pub data: Vec<u8>,
}

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: Hash256,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub previous: OutPoint,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub asset_id: Hash256,
    pub value: Fixed64,
    pub program_hash: ProgramHash,
}

/// A complete transaction.
///
/// `fee` and `fee_per_kb` are mempool-populated metadata; they are carried
/// on the struct for block assembly but excluded from the hash preimage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_type: TxType,
    pub payload_version: u8,
    pub payload: Payload,
    pub attributes: Vec<Attribute>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub lock_time: u32,
    pub fee: Fixed64,
    pub fee_per_kb: Fixed64,
}

impl Transaction {
    /// Create a coinbase transaction paying the foundation and miner.
    /// Output values are filled in after fee collection.
    pub fn new_coinbase(
        coinbase_data: Vec<u8>,
        current_height: u32,
        asset_id: Hash256,
        foundation: ProgramHash,
        miner: ProgramHash,
    ) -> Self {
        Transaction {
            tx_type: TxType::CoinBase,
            payload_version: 0,
            payload: Payload::CoinBase { data: coinbase_data },
            attributes: Vec::new(),
            inputs: vec![Input {
                previous: OutPoint { tx_id: EMPTY_HASH, index: 0x0000 },
                sequence: 0x0000_0000,
            }],
            outputs: vec![
                Output { asset_id, value: 0, program_hash: foundation },
                Output { asset_id, value: 0, program_hash: miner },
            ],
            lock_time: current_height,
            fee: 0,
            fee_per_kb: 0,
        }
    }

    /// Create the side-chain-pow transaction that carries a side block hash
    /// into the aux-pow commitment.
    pub fn new_side_chain_pow(side_block_hash: Hash256, side_genesis_hash: Hash256) -> Self {
        Transaction {
            tx_type: TxType::SideChainPow,
            payload_version: 0,
            payload: Payload::SideChainPow { side_block_hash, side_genesis_hash },
            attributes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            fee: 0,
            fee_per_kb: 0,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TxType::CoinBase
    }

    /// Serialize the hash preimage: every consensus field, little-endian,
    /// in declaration order. Mempool metadata is not part of it.
    fn write_preimage(&self, w: &mut Vec<u8>) {
        w.push(self.tx_type as u8);
        w.push(self.payload_version);
        match &self.payload {
            Payload::CoinBase { data } => {
                w.push(0x00);
                write_bytes(w, data);
            }
            Payload::RegisterAsset { asset, amount, controller } => {
                w.push(0x01);
                write_bytes(w, asset.name.as_bytes());
                w.push(asset.precision);
                w.push(asset.asset_type);
                w.extend_from_slice(&amount.to_le_bytes());
                w.extend_from_slice(controller);
            }
            Payload::TransferAsset => w.push(0x02),
            Payload::SideChainPow { side_block_hash, side_genesis_hash } => {
                w.push(0x05);
                w.extend_from_slice(side_block_hash);
                w.extend_from_slice(side_genesis_hash);
            }
        }
        w.extend_from_slice(&(self.attributes.len() as u32).to_le_bytes());
        for attr in &self.attributes {
            w.push(attr.usage as u8);
            write_bytes(w, &attr.data);
        }
        w.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            w.extend_from_slice(&input.previous.tx_id);
            w.extend_from_slice(&input.previous.index.to_le_bytes());
            w.extend_from_slice(&input.sequence.to_le_bytes());
        }
        w.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            w.extend_from_slice(&output.asset_id);
            w.extend_from_slice(&output.value.to_le_bytes());
            w.extend_from_slice(&output.program_hash);
        }
        w.extend_from_slice(&self.lock_time.to_le_bytes());
    }

    pub fn hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(256);
        self.write_preimage(&mut buf);
        crypto::sha256d(&buf)
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

fn write_bytes(w: &mut Vec<u8>, data: &[u8]) {
    w.extend_from_slice(&(data.len() as u32).to_le_bytes());
    w.extend_from_slice(data);
}

// ─── Block Types ─────────────────────────────────────────────────────

/// Block header.
///
/// The header hash covers every field except `side_aux_pow`: the proof is
/// attached after the nonce search solves the parent header, so it cannot
/// be part of its own commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub previous: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    /// Compact-bits difficulty encoding of the 256-bit target
    pub bits: u32,
    pub nonce: u32,
    pub height: u32,
    pub side_aux_pow: SideAuxPow,
}

impl Header {
    pub fn hash(&self) -> Hash256 {
        let mut buf = Vec::with_capacity(108);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.previous);
        buf.extend_from_slice(&self.merkle_root);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        crypto::sha256d(&buf)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block #{} [{}] bits={:#010x} ts={}",
            self.height,
            hex::encode(self.hash()),
            self.bits,
            self.timestamp,
        )
    }
}

/// A complete block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn compute_merkle_root(&self) -> Hash256 {
        let hashes: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash()).collect();
        crypto::merkle_root(&hashes)
    }

    pub fn validate_merkle_root(&self) -> bool {
        self.header.merkle_root == self.compute_merkle_root()
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

/// Lock-time finality: a transaction is final at `height` when its lock
/// time is unset, already passed, or every input opted out via a max
/// sequence number.
pub fn is_finalized_transaction(tx: &Transaction, height: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    if tx.lock_time < height {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == u32::MAX)
}
