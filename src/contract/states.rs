use serde::{Deserialize, Serialize};

use crate::core::types::{Fixed64, Hash256, ProgramHash};

/// Namespace tag for contract-layer state records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatePrefix {
    Asset,
    Contract,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetState {
    pub asset_id: Hash256,
    pub asset_type: u8,
    pub name: String,
    pub amount: Fixed64,
    pub precision: u8,
    pub admin: ProgramHash,
    pub issuer: ProgramHash,
    /// Owner public key bytes
    pub owner: Vec<u8>,
    /// Height at which the registration lapses
    pub expiration: u32,
    pub is_frozen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCode {
    pub code: Vec<u8>,
    pub parameter_types: Vec<u8>,
    pub return_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractState {
    pub code: FunctionCode,
    pub name: String,
    pub version: String,
    pub author: String,
    pub email: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageItem {
    pub value: Vec<u8>,
}

/// Storage keys are qualified by the owning contract's code hash, so
/// contracts cannot read or clobber each other's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageKey {
    pub code_hash: ProgramHash,
    pub key: Vec<u8>,
}

impl StorageKey {
    pub fn new(code_hash: ProgramHash, key: Vec<u8>) -> Self {
        StorageKey { code_hash, key }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(21 + self.key.len());
        bytes.extend_from_slice(&self.code_hash);
        bytes.extend_from_slice(&self.key);
        bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateItem {
    Asset(AssetState),
    Contract(ContractState),
    Storage(StorageItem),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_keys_namespace_by_contract() {
        let a = StorageKey::new([1u8; 21], b"balance".to_vec());
        let b = StorageKey::new([2u8; 21], b"balance".to_vec());
        assert_ne!(a.to_bytes(), b.to_bytes());
        assert_eq!(a.to_bytes().len(), 21 + 7);
    }
}
