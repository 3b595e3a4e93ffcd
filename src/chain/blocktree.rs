//! The in-memory block tree: every header observed recently lives here as
//! a node carrying its cumulative work. Nodes are stored in an arena and
//! linked by index, so parent/child references stay cheap and pruning is a
//! free-list operation rather than a reference-count puzzle.

use num_bigint::BigUint;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::chain::errors::ChainError;
use crate::core::params::MEDIAN_TIME_BLOCKS;
use crate::core::types::{Hash256, Header};
use crate::pow::calc_work;

/// Stable arena index of a [`BlockNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
pub struct BlockNode {
    pub hash: Hash256,
    pub parent_hash: Hash256,
    pub height: u32,
    pub version: u32,
    pub bits: u32,
    pub timestamp: u32,
    /// Cumulative work from the tree root through this node
    pub work_sum: BigUint,
    pub in_main_chain: bool,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl BlockNode {
    pub fn from_header(header: &Header, hash: Hash256) -> Self {
        BlockNode {
            hash,
            parent_hash: header.previous,
            height: header.height,
            version: header.version,
            bits: header.bits,
            timestamp: header.timestamp,
            work_sum: calc_work(header.bits),
            in_main_chain: true,
            parent: None,
            children: Vec::new(),
        }
    }
}

pub struct BlockTree {
    arena: Vec<Option<BlockNode>>,
    free: Vec<usize>,
    /// Hash index behind its own lock so lookups can run while a long
    /// acceptance operation holds the chain lock
    index: RwLock<HashMap<Hash256, NodeId>>,
    /// parent hash -> nodes waiting on (or hanging off) that parent
    dep_nodes: HashMap<Hash256, Vec<NodeId>>,
    root: Option<NodeId>,
    best: Option<NodeId>,
}

impl BlockTree {
    pub fn new() -> Self {
        BlockTree {
            arena: Vec::new(),
            free: Vec::new(),
            index: RwLock::new(HashMap::new()),
            dep_nodes: HashMap::new(),
            root: None,
            best: None,
        }
    }

    pub fn node(&self, id: NodeId) -> &BlockNode {
        self.arena[id.0].as_ref().expect("stale block node id")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockNode {
        self.arena[id.0].as_mut().expect("stale block node id")
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn best(&self) -> Option<NodeId> {
        self.best
    }

    pub fn set_best(&mut self, best: Option<NodeId>) {
        self.best = best;
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.index.read().get(hash).copied()
    }

    pub fn insert_index(&self, hash: Hash256, id: NodeId) {
        self.index.write().insert(hash, id);
    }

    fn remove_index(&self, hash: &Hash256) {
        self.index.write().remove(hash);
    }

    /// Record `id` under its parent hash in the dependency index.
    pub fn add_dep(&mut self, prev_hash: Hash256, id: NodeId) {
        let bucket = self.dep_nodes.entry(prev_hash).or_default();
        if !bucket.contains(&id) {
            bucket.push(id);
        }
    }

    fn alloc(&mut self, node: BlockNode) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.arena.push(Some(node));
                NodeId(self.arena.len() - 1)
            }
        }
    }

    /// Allocate a node outside the indices. Used by the acceptance path,
    /// which indexes the node itself once chain selection decides where it
    /// belongs.
    pub fn new_node(&mut self, header: &Header, hash: Hash256) -> NodeId {
        self.alloc(BlockNode::from_header(header, hash))
    }

    /// Splice a header loaded from the store into the tree.
    ///
    /// Three placements are possible: the node grafts onto a known parent,
    /// the node adopts previously observed children whose parent was
    /// unknown (becoming the tree root), or the tree is empty and the node
    /// becomes the first root. Splicing a disconnected node into a
    /// non-empty tree is an error.
    pub fn load_node(&mut self, header: &Header, hash: &Hash256) -> Result<NodeId, ChainError> {
        let prev_hash = header.previous;
        let node = BlockNode::from_header(header, *hash);
        let own_work = node.work_sum.clone();

        let id = if let Some(parent_id) = self.lookup(&prev_hash) {
            // grafted as a child: extend the parent's work sum
            let mut node = node;
            node.work_sum = self.node(parent_id).work_sum.clone() + own_work;
            node.parent = Some(parent_id);
            let id = self.alloc(node);
            self.node_mut(parent_id).children.push(id);
            id
        } else if self.dep_nodes.get(hash).is_some_and(|c| !c.is_empty()) {
            // becomes the root of an already-observed subtree: adopt the
            // children and fold this node's work into every descendant
            let id = self.alloc(node);
            let children = self.dep_nodes.get(hash).cloned().unwrap_or_default();
            for child in children {
                self.node_mut(child).parent = Some(id);
                self.node_mut(id).children.push(child);
                self.node_mut(child).work_sum += &own_work;
                self.add_descendants_work(child, &own_work);
                self.root = Some(id);
            }
            id
        } else {
            // neither linked nor awaited: only allowed as the first node
            if self.root.is_some() {
                return Err(ChainError::OrphanLoadForbidden(*hash));
            }
            let id = self.alloc(node);
            self.root = Some(id);
            id
        };

        self.insert_index(*hash, id);
        self.add_dep(prev_hash, id);
        Ok(id)
    }

    /// Add `work` to every strict descendant of `start`.
    fn add_descendants_work(&mut self, start: NodeId, work: &BigUint) {
        let mut stack: Vec<NodeId> = self.node(start).children.clone();
        while let Some(id) = stack.pop() {
            self.node_mut(id).work_sum += work;
            stack.extend(self.node(id).children.iter().copied());
        }
    }

    /// Median of the timestamps of `id` and up to ten of its ancestors.
    pub fn past_median_time(&self, id: NodeId) -> u32 {
        let mut timestamps = Vec::with_capacity(MEDIAN_TIME_BLOCKS);
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            if timestamps.len() == MEDIAN_TIME_BLOCKS {
                break;
            }
            let node = self.node(node_id);
            timestamps.push(node.timestamp);
            cursor = node.parent;
        }
        timestamps.sort_unstable();
        timestamps[timestamps.len() / 2]
    }

    /// Drop every node more than `min_memory_nodes - 1` behind the best
    /// tip. Purely in-memory: the store keeps the blocks.
    pub fn prune(&mut self, min_memory_nodes: u32) {
        let Some(best) = self.best else { return };

        let mut new_root = Some(best);
        for _ in 0..min_memory_nodes.saturating_sub(1) {
            match new_root {
                Some(id) => new_root = self.node(id).parent,
                None => return,
            }
        }
        let Some(new_root) = new_root else { return };
        if self.node(new_root).parent.is_none() {
            return;
        }

        // everything before the new root goes, oldest first so each
        // removal unlinks the next one
        let mut delete = Vec::new();
        let mut cursor = self.node(new_root).parent;
        while let Some(id) = cursor {
            delete.push(id);
            cursor = self.node(id).parent;
        }
        delete.reverse();
        for id in delete {
            self.remove(id);
        }

        self.root = Some(new_root);
    }

    /// Remove a node from the tree. The node must already be unlinked
    /// from its parent (pruning removes oldest-first, which guarantees
    /// this).
    fn remove(&mut self, id: NodeId) {
        assert!(
            self.node(id).parent.is_none(),
            "remove called on a node still linked to a parent"
        );

        let hash = self.node(id).hash;
        let parent_hash = self.node(id).parent_hash;
        self.remove_index(&hash);

        let children = std::mem::take(&mut self.node_mut(id).children);
        for child in children {
            self.node_mut(child).parent = None;
        }

        if let Some(bucket) = self.dep_nodes.get_mut(&parent_hash) {
            bucket.retain(|entry| *entry != id);
            if bucket.is_empty() {
                self.dep_nodes.remove(&parent_hash);
            }
        }

        self.arena[id.0] = None;
        self.free.push(id.0);
    }

    /// Number of live nodes, for diagnostics.
    pub fn len(&self) -> usize {
        self.arena.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
