//! Two-level write-through buffer over the contract state store. Writes
//! land in the inner draft layer; a successful invocation promotes the
//! draft into the outer committed layer, a failed one just drops it. Reads
//! check draft, then committed, then the backing store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::contract::states::{StateItem, StatePrefix};

/// Read access to persisted contract state.
pub trait StateStore: Send + Sync {
    fn get(&self, prefix: StatePrefix, key: &[u8]) -> Option<StateItem>;
}

#[derive(Debug, Clone)]
enum WriteOp {
    Put(StateItem),
    Delete,
}

#[derive(Debug, Clone, Default)]
struct WriteSet {
    ops: HashMap<(StatePrefix, Vec<u8>), WriteOp>,
}

impl WriteSet {
    fn get(&self, prefix: StatePrefix, key: &[u8]) -> Option<&WriteOp> {
        self.ops.get(&(prefix, key.to_vec()))
    }

    fn put(&mut self, prefix: StatePrefix, key: Vec<u8>, item: StateItem) {
        self.ops.insert((prefix, key), WriteOp::Put(item));
    }

    fn delete(&mut self, prefix: StatePrefix, key: Vec<u8>) {
        self.ops.insert((prefix, key), WriteOp::Delete);
    }

    fn merge(&mut self, other: WriteSet) {
        self.ops.extend(other.ops);
    }
}

pub struct CloneCache {
    backing: Arc<dyn StateStore>,
    committed: WriteSet,
    draft: WriteSet,
}

impl CloneCache {
    pub fn new(backing: Arc<dyn StateStore>) -> Self {
        CloneCache {
            backing,
            committed: WriteSet::default(),
            draft: WriteSet::default(),
        }
    }

    pub fn try_get(&self, prefix: StatePrefix, key: &[u8]) -> Option<StateItem> {
        for layer in [&self.draft, &self.committed] {
            match layer.get(prefix, key) {
                Some(WriteOp::Put(item)) => return Some(item.clone()),
                Some(WriteOp::Delete) => return None,
                None => {}
            }
        }
        self.backing.get(prefix, key)
    }

    pub fn put(&mut self, prefix: StatePrefix, key: Vec<u8>, item: StateItem) {
        self.draft.put(prefix, key, item);
    }

    pub fn delete(&mut self, prefix: StatePrefix, key: Vec<u8>) {
        self.draft.delete(prefix, key);
    }

    /// Return the existing item for `key`, writing `item` only when there
    /// is none yet.
    pub fn get_or_add(&mut self, prefix: StatePrefix, key: Vec<u8>, item: StateItem) -> StateItem {
        match self.try_get(prefix, &key) {
            Some(existing) => existing,
            None => {
                self.draft.put(prefix, key, item.clone());
                item
            }
        }
    }

    /// Promote the draft layer into the committed layer.
    pub fn commit(&mut self) {
        let draft = std::mem::take(&mut self.draft);
        self.committed.merge(draft);
    }

    /// Drop the draft layer.
    pub fn discard(&mut self) {
        self.draft = WriteSet::default();
    }
}

/// Simple map-backed [`StateStore`].
#[derive(Default)]
pub struct MemoryStateStore {
    items: parking_lot::RwLock<HashMap<(StatePrefix, Vec<u8>), StateItem>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, prefix: StatePrefix, key: Vec<u8>, item: StateItem) {
        self.items.write().insert((prefix, key), item);
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, prefix: StatePrefix, key: &[u8]) -> Option<StateItem> {
        self.items.read().get(&(prefix, key.to_vec())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::states::StorageItem;

    fn item(tag: u8) -> StateItem {
        StateItem::Storage(StorageItem { value: vec![tag] })
    }

    #[test]
    fn test_draft_reads_and_discard() {
        let cache = &mut CloneCache::new(Arc::new(MemoryStateStore::new()));
        cache.put(StatePrefix::Storage, b"k".to_vec(), item(1));
        assert_eq!(cache.try_get(StatePrefix::Storage, b"k"), Some(item(1)));

        cache.discard();
        assert_eq!(cache.try_get(StatePrefix::Storage, b"k"), None);
    }

    #[test]
    fn test_commit_promotes_draft() {
        let cache = &mut CloneCache::new(Arc::new(MemoryStateStore::new()));
        cache.put(StatePrefix::Storage, b"k".to_vec(), item(1));
        cache.commit();
        // a later discard only drops the new draft layer
        cache.put(StatePrefix::Storage, b"k".to_vec(), item(2));
        cache.discard();
        assert_eq!(cache.try_get(StatePrefix::Storage, b"k"), Some(item(1)));
    }

    #[test]
    fn test_backing_fallback_and_delete_shadow() {
        let backing = Arc::new(MemoryStateStore::new());
        backing.put(StatePrefix::Storage, b"k".to_vec(), item(9));
        let cache = &mut CloneCache::new(backing);
        assert_eq!(cache.try_get(StatePrefix::Storage, b"k"), Some(item(9)));

        // a draft delete shadows the backing entry
        cache.delete(StatePrefix::Storage, b"k".to_vec());
        assert_eq!(cache.try_get(StatePrefix::Storage, b"k"), None);
        cache.discard();
        assert_eq!(cache.try_get(StatePrefix::Storage, b"k"), Some(item(9)));
    }

    #[test]
    fn test_get_or_add() {
        let cache = &mut CloneCache::new(Arc::new(MemoryStateStore::new()));
        assert_eq!(
            cache.get_or_add(StatePrefix::Storage, b"k".to_vec(), item(1)),
            item(1)
        );
        // second add keeps the existing value
        assert_eq!(
            cache.get_or_add(StatePrefix::Storage, b"k".to_vec(), item(2)),
            item(1)
        );
    }

    #[test]
    fn test_prefixes_are_isolated() {
        let cache = &mut CloneCache::new(Arc::new(MemoryStateStore::new()));
        cache.put(StatePrefix::Storage, b"k".to_vec(), item(1));
        assert_eq!(cache.try_get(StatePrefix::Asset, b"k"), None);
        assert_eq!(cache.try_get(StatePrefix::Contract, b"k"), None);
    }
}
