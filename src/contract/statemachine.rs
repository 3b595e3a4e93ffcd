//! Named system services the scripting VM dispatches into. Every mutation
//! goes through the clone cache, so the caller decides per invocation
//! whether the draft survives (`commit`) or vanishes (`discard`).

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::contract::clonecache::{CloneCache, StateStore};
use crate::contract::engine::{ExecutionEngine, InteropValue, StorageContext};
use crate::contract::states::{
    AssetState, ContractState, FunctionCode, StateItem, StatePrefix, StorageItem, StorageKey,
};
use crate::contract::ContractError;
use crate::core::types::ProgramHash;

/// Maximum asset name length in bytes
const MAX_ASSET_NAME: usize = 1024;
/// Maximum contract code size
const MAX_CONTRACT_CODE: usize = 1024 * 1024;
/// Maximum length of parameters, name, version, author and email fields
const MAX_CONTRACT_FIELD: usize = 252;
/// Maximum contract description length
const MAX_CONTRACT_DESCRIPTION: usize = 65_536;
/// Blocks one renewal period adds to an asset registration
const ASSET_RENEWAL_BLOCKS: u32 = 2_000_000;

type SysCall = fn(&mut StateMachine, &mut ExecutionEngine) -> Result<bool, ContractError>;

pub struct StateMachine {
    pub clone_cache: CloneCache,
    handlers: HashMap<&'static str, SysCall>,
    /// Store height at construction, used for asset expirations
    current_height: u32,
}

impl StateMachine {
    pub fn new(backing: Arc<dyn StateStore>, current_height: u32) -> Self {
        let mut machine = StateMachine {
            clone_cache: CloneCache::new(backing),
            handlers: HashMap::new(),
            current_height,
        };

        machine.register("Asset.Create", |sm, e| sm.create_asset(e));
        machine.register("Asset.Renew", |sm, e| sm.asset_renew(e));
        machine.register("Contract.Create", |sm, e| sm.create_contract(e));
        machine.register("Contract.Destroy", |sm, e| sm.contract_destroy(e));
        machine.register("Contract.GetStorageContext", |sm, e| sm.get_storage_context(e));
        machine.register("Blockchain.GetContract", |sm, e| sm.get_contract(e));
        machine.register("Storage.Get", |sm, e| sm.storage_get(e));
        machine.register("Storage.Put", |sm, e| sm.storage_put(e));
        machine.register("Storage.Delete", |sm, e| sm.storage_delete(e));

        machine
    }

    fn register(&mut self, name: &'static str, handler: SysCall) {
        self.handlers.insert(name, handler);
    }

    /// Dispatch a system service by name.
    pub fn invoke(&mut self, name: &str, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let handler = self
            .handlers
            .get(name)
            .copied()
            .ok_or_else(|| ContractError::UnknownService(name.to_string()))?;
        handler(self, engine)
    }

    /// Promote the invocation's writes.
    pub fn commit(&mut self) {
        self.clone_cache.commit();
    }

    /// Drop the invocation's writes.
    pub fn discard(&mut self) {
        self.clone_cache.discard();
    }

    // ─── Asset services ─────────────────────────────────────────────

    fn create_asset(&mut self, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let asset_id = engine.data_container()?.hash();

        let asset_type = engine.pop_integer()?;
        let name = engine.pop_byte_array()?;
        if name.len() > MAX_ASSET_NAME {
            return Err(ContractError::AssetNameInvalid);
        }
        let amount = engine.pop_integer()?;
        if amount == 0 {
            return Err(ContractError::AssetAmountInvalid);
        }
        let precision = engine.pop_integer()?;
        if !(0..=8).contains(&precision) {
            return Err(ContractError::AssetPrecisionInvalid);
        }
        // amounts must be representable at the declared precision
        let unit = 10i64.pow(8 - precision as u32);
        if amount % unit != 0 {
            return Err(ContractError::AssetAmountInvalid);
        }
        let owner = engine.pop_byte_array()?;
        let admin = program_hash_from_bytes(&engine.pop_byte_array()?)?;
        let issuer = program_hash_from_bytes(&engine.pop_byte_array()?)?;

        let state = AssetState {
            asset_id,
            asset_type: asset_type as u8,
            name: String::from_utf8_lossy(&name).into_owned(),
            amount,
            precision: precision as u8,
            admin,
            issuer,
            owner,
            expiration: self.current_height + 1 + ASSET_RENEWAL_BLOCKS,
            is_frozen: false,
        };
        self.clone_cache.put(
            StatePrefix::Asset,
            asset_id.to_vec(),
            StateItem::Asset(state.clone()),
        );
        engine.push_interop(InteropValue::Asset(state));
        Ok(true)
    }

    fn asset_renew(&mut self, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let asset = match engine.pop_interop()? {
            InteropValue::Asset(asset) => asset,
            _ => return Err(ContractError::TypeMismatch("asset state")),
        };
        let years = engine.pop_integer()?;

        let key = asset.asset_id.to_vec();
        let mut state = match self.clone_cache.try_get(StatePrefix::Asset, &key) {
            Some(StateItem::Asset(state)) => state,
            _ => return Err(ContractError::NotFound("asset")),
        };

        let height = self.current_height + 1;
        if state.expiration < height {
            state.expiration = height;
        }
        state.expiration += years as u32 * ASSET_RENEWAL_BLOCKS;
        self.clone_cache.put(StatePrefix::Asset, key, StateItem::Asset(state));
        Ok(true)
    }

    // ─── Contract services ──────────────────────────────────────────

    fn create_contract(&mut self, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let code = engine.pop_byte_array()?;
        if code.len() > MAX_CONTRACT_CODE {
            return Ok(false);
        }
        let parameter_types = engine.pop_byte_array()?;
        if parameter_types.len() > MAX_CONTRACT_FIELD {
            return Ok(false);
        }
        let return_type = engine.pop_integer()?;
        let name = engine.pop_byte_array()?;
        if name.len() > MAX_CONTRACT_FIELD {
            return Ok(false);
        }
        let version = engine.pop_byte_array()?;
        if version.len() > MAX_CONTRACT_FIELD {
            return Ok(false);
        }
        let author = engine.pop_byte_array()?;
        if author.len() > MAX_CONTRACT_FIELD {
            return Ok(false);
        }
        let email = engine.pop_byte_array()?;
        if email.len() > MAX_CONTRACT_FIELD {
            return Ok(false);
        }
        let description = engine.pop_byte_array()?;
        if description.len() > MAX_CONTRACT_DESCRIPTION {
            return Ok(false);
        }

        let state = ContractState {
            code: FunctionCode {
                code: code.clone(),
                parameter_types,
                return_type: return_type as u8,
            },
            name: hex::encode(name),
            version: hex::encode(version),
            author: hex::encode(author),
            email: hex::encode(email),
            description: hex::encode(description),
        };
        let code_hash = code_hash_of(&code);
        let stored = self.clone_cache.get_or_add(
            StatePrefix::Contract,
            code_hash.to_vec(),
            StateItem::Contract(state),
        );
        if let StateItem::Contract(contract) = stored {
            engine.push_interop(InteropValue::Contract(contract));
        }
        Ok(true)
    }

    fn get_contract(&mut self, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let hash = program_hash_from_bytes(&engine.pop_byte_array()?)?;
        match self.clone_cache.try_get(StatePrefix::Contract, &hash) {
            Some(StateItem::Contract(contract)) => {
                engine.push_interop(InteropValue::Contract(contract));
                Ok(true)
            }
            _ => Err(ContractError::NotFound("contract")),
        }
    }

    fn contract_destroy(&mut self, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let script = engine.executing_script();
        if script.is_empty() {
            return Ok(false);
        }
        let code_hash = code_hash_of(script);
        if self.clone_cache.try_get(StatePrefix::Contract, &code_hash).is_none() {
            return Ok(false);
        }
        self.clone_cache.delete(StatePrefix::Contract, code_hash.to_vec());
        Ok(true)
    }

    fn get_storage_context(&mut self, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let code_hash = code_hash_of(engine.executing_script());
        engine.push_interop(InteropValue::StorageContext(StorageContext { code_hash }));
        Ok(true)
    }

    // ─── Storage services ───────────────────────────────────────────

    fn check_storage_context(&self, context: &StorageContext) -> Result<(), ContractError> {
        match self.clone_cache.try_get(StatePrefix::Contract, &context.code_hash) {
            Some(_) => Ok(()),
            None => Err(ContractError::NotFound("storage context contract")),
        }
    }

    fn pop_storage_context(engine: &mut ExecutionEngine) -> Result<StorageContext, ContractError> {
        match engine.pop_interop()? {
            InteropValue::StorageContext(context) => Ok(context),
            _ => Err(ContractError::TypeMismatch("storage context")),
        }
    }

    fn storage_get(&mut self, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let context = Self::pop_storage_context(engine)?;
        self.check_storage_context(&context)?;
        let key = engine.pop_byte_array()?;
        let storage_key = StorageKey::new(context.code_hash, key);
        match self.clone_cache.try_get(StatePrefix::Storage, &storage_key.to_bytes()) {
            Some(StateItem::Storage(item)) => engine.push_bytes(item.value),
            _ => engine.push_bytes(Vec::new()),
        }
        Ok(true)
    }

    fn storage_put(&mut self, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let context = Self::pop_storage_context(engine)?;
        let key = engine.pop_byte_array()?;
        let value = engine.pop_byte_array()?;
        let storage_key = StorageKey::new(context.code_hash, key);
        self.clone_cache.put(
            StatePrefix::Storage,
            storage_key.to_bytes(),
            StateItem::Storage(StorageItem { value }),
        );
        Ok(true)
    }

    fn storage_delete(&mut self, engine: &mut ExecutionEngine) -> Result<bool, ContractError> {
        let context = Self::pop_storage_context(engine)?;
        let key = engine.pop_byte_array()?;
        let storage_key = StorageKey::new(context.code_hash, key);
        self.clone_cache.delete(StatePrefix::Storage, storage_key.to_bytes());
        Ok(true)
    }
}

/// Code hash of a contract script: SHA-256 truncated to program-hash size.
pub fn code_hash_of(code: &[u8]) -> ProgramHash {
    let digest = Sha256::digest(code);
    let mut hash = [0u8; 21];
    hash.copy_from_slice(&digest[..21]);
    hash
}

fn program_hash_from_bytes(bytes: &[u8]) -> Result<ProgramHash, ContractError> {
    if bytes.len() != 21 {
        return Err(ContractError::BadProgramHash);
    }
    let mut hash = [0u8; 21];
    hash.copy_from_slice(bytes);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::clonecache::MemoryStateStore;
    use crate::core::types::Transaction;

    fn machine() -> StateMachine {
        StateMachine::new(Arc::new(MemoryStateStore::new()), 100)
    }

    fn asset_engine(amount: i64, precision: i64, name_len: usize) -> ExecutionEngine {
        let tx = Transaction::new_side_chain_pow([1u8; 32], [2u8; 32]);
        let mut engine = ExecutionEngine::new(Some(tx), Vec::new());
        // popped in reverse order of these pushes
        engine.push_bytes(vec![3u8; 21]); // issuer
        engine.push_bytes(vec![2u8; 21]); // admin
        engine.push_bytes(vec![1u8; 33]); // owner pubkey
        engine.push_integer(precision);
        engine.push_integer(amount);
        engine.push_bytes(vec![b'T'; name_len]);
        engine.push_integer(0); // asset type
        engine
    }

    #[test]
    fn test_create_asset() {
        let mut sm = machine();
        let mut engine = asset_engine(500_000_000, 8, 5);
        assert!(sm.invoke("Asset.Create", &mut engine).unwrap());

        let asset_id = engine.data_container().unwrap().hash();
        match sm.clone_cache.try_get(StatePrefix::Asset, &asset_id) {
            Some(StateItem::Asset(asset)) => {
                assert_eq!(asset.amount, 500_000_000);
                assert_eq!(asset.precision, 8);
                assert_eq!(asset.expiration, 100 + 1 + ASSET_RENEWAL_BLOCKS);
            }
            other => panic!("asset not stored: {:?}", other),
        }
        // the new state is also pushed back for the script
        assert_eq!(engine.stack_len(), 1);
    }

    #[test]
    fn test_create_asset_bounds() {
        let mut sm = machine();

        let mut engine = asset_engine(500_000_000, 8, MAX_ASSET_NAME + 1);
        assert!(matches!(
            sm.invoke("Asset.Create", &mut engine),
            Err(ContractError::AssetNameInvalid)
        ));

        let mut engine = asset_engine(500_000_000, 9, 5);
        assert!(matches!(
            sm.invoke("Asset.Create", &mut engine),
            Err(ContractError::AssetPrecisionInvalid)
        ));

        // precision 6 requires multiples of 100
        let mut engine = asset_engine(150, 6, 5);
        assert!(matches!(
            sm.invoke("Asset.Create", &mut engine),
            Err(ContractError::AssetAmountInvalid)
        ));

        let mut engine = asset_engine(0, 8, 5);
        assert!(matches!(
            sm.invoke("Asset.Create", &mut engine),
            Err(ContractError::AssetAmountInvalid)
        ));
    }

    #[test]
    fn test_asset_renew() {
        let mut sm = machine();
        let mut engine = asset_engine(500_000_000, 8, 5);
        sm.invoke("Asset.Create", &mut engine).unwrap();
        let asset = match engine.pop_interop().unwrap() {
            InteropValue::Asset(asset) => asset,
            _ => unreachable!(),
        };
        let before = asset.expiration;

        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_integer(2);
        engine.push_interop(InteropValue::Asset(asset.clone()));
        assert!(sm.invoke("Asset.Renew", &mut engine).unwrap());

        match sm.clone_cache.try_get(StatePrefix::Asset, &asset.asset_id) {
            Some(StateItem::Asset(renewed)) => {
                assert_eq!(renewed.expiration, before + 2 * ASSET_RENEWAL_BLOCKS)
            }
            other => panic!("asset not stored: {:?}", other),
        }
    }

    fn contract_engine(code: Vec<u8>, name_len: usize) -> ExecutionEngine {
        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_bytes(b"a contract".to_vec()); // description
        engine.push_bytes(b"dev@example.com".to_vec()); // email
        engine.push_bytes(b"dev".to_vec()); // author
        engine.push_bytes(b"1.0".to_vec()); // version
        engine.push_bytes(vec![b'C'; name_len]); // name
        engine.push_integer(0); // return type
        engine.push_bytes(vec![0x01]); // parameter types
        engine.push_bytes(code);
        engine
    }

    #[test]
    fn test_create_and_get_contract() {
        let mut sm = machine();
        let code = vec![0xAB, 0xCD, 0xEF];
        let mut engine = contract_engine(code.clone(), 4);
        assert!(sm.invoke("Contract.Create", &mut engine).unwrap());

        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_bytes(code_hash_of(&code).to_vec());
        assert!(sm.invoke("Blockchain.GetContract", &mut engine).unwrap());
        match engine.pop_interop().unwrap() {
            InteropValue::Contract(contract) => assert_eq!(contract.code.code, code),
            other => panic!("unexpected stack item: {:?}", other),
        }
    }

    #[test]
    fn test_create_contract_bounds_fail_softly() {
        let mut sm = machine();
        let mut engine = contract_engine(vec![0u8; MAX_CONTRACT_CODE + 1], 4);
        assert!(!sm.invoke("Contract.Create", &mut engine).unwrap());

        let mut engine = contract_engine(vec![0xAB], MAX_CONTRACT_FIELD + 1);
        assert!(!sm.invoke("Contract.Create", &mut engine).unwrap());
    }

    #[test]
    fn test_contract_destroy() {
        let mut sm = machine();
        let code = vec![0x01, 0x02];
        let mut engine = contract_engine(code.clone(), 4);
        sm.invoke("Contract.Create", &mut engine).unwrap();
        sm.commit();

        // destroying from an unrelated script is a soft failure
        let mut engine = ExecutionEngine::new(None, vec![0xFF]);
        assert!(!sm.invoke("Contract.Destroy", &mut engine).unwrap());

        let mut engine = ExecutionEngine::new(None, code.clone());
        assert!(sm.invoke("Contract.Destroy", &mut engine).unwrap());
        assert!(sm
            .clone_cache
            .try_get(StatePrefix::Contract, &code_hash_of(&code))
            .is_none());
    }

    #[test]
    fn test_storage_round_trip_and_namespacing() {
        let mut sm = machine();
        // register the contract whose context we use
        let code = vec![0x11];
        let mut engine = contract_engine(code.clone(), 4);
        sm.invoke("Contract.Create", &mut engine).unwrap();
        sm.commit();

        let context = StorageContext { code_hash: code_hash_of(&code) };

        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_bytes(b"v1".to_vec());
        engine.push_bytes(b"key".to_vec());
        engine.push_interop(InteropValue::StorageContext(context.clone()));
        assert!(sm.invoke("Storage.Put", &mut engine).unwrap());

        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_bytes(b"key".to_vec());
        engine.push_interop(InteropValue::StorageContext(context.clone()));
        assert!(sm.invoke("Storage.Get", &mut engine).unwrap());
        assert_eq!(engine.pop_byte_array().unwrap(), b"v1".to_vec());

        // a different contract does not see the key; its context is not
        // even registered, which storage_get rejects
        let other = StorageContext { code_hash: [9u8; 21] };
        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_bytes(b"key".to_vec());
        engine.push_interop(InteropValue::StorageContext(other));
        assert!(matches!(
            sm.invoke("Storage.Get", &mut engine),
            Err(ContractError::NotFound(_))
        ));

        // delete, then a fresh read yields the empty value
        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_bytes(b"key".to_vec());
        engine.push_interop(InteropValue::StorageContext(context.clone()));
        assert!(sm.invoke("Storage.Delete", &mut engine).unwrap());

        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_bytes(b"key".to_vec());
        engine.push_interop(InteropValue::StorageContext(context));
        assert!(sm.invoke("Storage.Get", &mut engine).unwrap());
        assert_eq!(engine.pop_byte_array().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_failed_invocation_discards_draft() {
        let mut sm = machine();
        let code = vec![0x22];
        let mut engine = contract_engine(code.clone(), 4);
        sm.invoke("Contract.Create", &mut engine).unwrap();
        sm.commit();

        let context = StorageContext { code_hash: code_hash_of(&code) };
        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_bytes(b"v1".to_vec());
        engine.push_bytes(b"key".to_vec());
        engine.push_interop(InteropValue::StorageContext(context.clone()));
        sm.invoke("Storage.Put", &mut engine).unwrap();

        // the invocation failed overall: its draft is dropped
        sm.discard();
        let storage_key = StorageKey::new(context.code_hash, b"key".to_vec());
        assert!(sm
            .clone_cache
            .try_get(StatePrefix::Storage, &storage_key.to_bytes())
            .is_none());
    }

    #[test]
    fn test_unknown_service() {
        let mut sm = machine();
        let mut engine = ExecutionEngine::new(None, Vec::new());
        assert!(matches!(
            sm.invoke("Neo.Runtime.Log", &mut engine),
            Err(ContractError::UnknownService(_))
        ));
    }

    #[test]
    fn test_get_storage_context_names_executing_script() {
        let mut sm = machine();
        let script = vec![0x33, 0x44];
        let mut engine = ExecutionEngine::new(None, script.clone());
        assert!(sm.invoke("Contract.GetStorageContext", &mut engine).unwrap());
        match engine.pop_interop().unwrap() {
            InteropValue::StorageContext(context) => {
                assert_eq!(context.code_hash, code_hash_of(&script))
            }
            other => panic!("unexpected stack item: {:?}", other),
        }
    }
}
