//! The slice of the scripting VM the system services can see: an
//! evaluation stack, the transaction being executed, and the executing
//! script. The VM itself lives outside this crate.

use crate::contract::states::{AssetState, ContractState};
use crate::contract::ContractError;
use crate::core::types::{ProgramHash, Transaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageContext {
    pub code_hash: ProgramHash,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InteropValue {
    StorageContext(StorageContext),
    Asset(AssetState),
    Contract(ContractState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StackItem {
    Integer(i64),
    Bytes(Vec<u8>),
    Interop(InteropValue),
}

pub struct ExecutionEngine {
    stack: Vec<StackItem>,
    data_container: Option<Transaction>,
    executing_script: Vec<u8>,
}

impl ExecutionEngine {
    pub fn new(data_container: Option<Transaction>, executing_script: Vec<u8>) -> Self {
        ExecutionEngine {
            stack: Vec::new(),
            data_container,
            executing_script,
        }
    }

    pub fn push(&mut self, item: StackItem) {
        self.stack.push(item);
    }

    pub fn push_integer(&mut self, value: i64) {
        self.stack.push(StackItem::Integer(value));
    }

    pub fn push_bytes(&mut self, bytes: Vec<u8>) {
        self.stack.push(StackItem::Bytes(bytes));
    }

    pub fn push_interop(&mut self, value: InteropValue) {
        self.stack.push(StackItem::Interop(value));
    }

    pub fn pop(&mut self) -> Result<StackItem, ContractError> {
        self.stack.pop().ok_or(ContractError::StackUnderflow)
    }

    pub fn pop_integer(&mut self) -> Result<i64, ContractError> {
        match self.pop()? {
            StackItem::Integer(value) => Ok(value),
            _ => Err(ContractError::TypeMismatch("integer")),
        }
    }

    pub fn pop_byte_array(&mut self) -> Result<Vec<u8>, ContractError> {
        match self.pop()? {
            StackItem::Bytes(bytes) => Ok(bytes),
            _ => Err(ContractError::TypeMismatch("byte array")),
        }
    }

    pub fn pop_interop(&mut self) -> Result<InteropValue, ContractError> {
        match self.pop()? {
            StackItem::Interop(value) => Ok(value),
            _ => Err(ContractError::TypeMismatch("interop interface")),
        }
    }

    pub fn data_container(&self) -> Result<&Transaction, ContractError> {
        self.data_container.as_ref().ok_or(ContractError::NoDataContainer)
    }

    pub fn executing_script(&self) -> &[u8] {
        &self.executing_script
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_and_underflow() {
        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_integer(1);
        engine.push_bytes(vec![2]);
        assert_eq!(engine.pop_byte_array().unwrap(), vec![2]);
        assert_eq!(engine.pop_integer().unwrap(), 1);
        assert!(matches!(engine.pop(), Err(ContractError::StackUnderflow)));
    }

    #[test]
    fn test_type_mismatch() {
        let mut engine = ExecutionEngine::new(None, Vec::new());
        engine.push_integer(7);
        assert!(matches!(
            engine.pop_byte_array(),
            Err(ContractError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_missing_data_container() {
        let engine = ExecutionEngine::new(None, Vec::new());
        assert!(matches!(
            engine.data_container(),
            Err(ContractError::NoDataContainer)
        ));
    }
}
