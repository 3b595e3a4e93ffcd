//! The block chain aggregate: acceptance pipeline, chain selection and
//! reorganization over the in-memory block tree, backed by a persistent
//! store.

pub mod blocktree;
pub mod difficulty;
pub mod errors;
pub mod events;
pub mod locator;
pub mod orphans;
pub mod timesource;
pub mod validator;

use num_bigint::BigUint;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::chain::blocktree::{BlockTree, NodeId};
use crate::chain::errors::{ChainError, Known};
use crate::chain::events::{EventBus, EventKind};
use crate::chain::orphans::OrphanPool;
use crate::chain::timesource::MedianTimeSource;
use crate::core::params::{pow_limit, DEFAULT_MAX_ORPHAN_BLOCKS, DEFAULT_MIN_MEMORY_NODES};
use crate::core::types::{Block, Fixed64, Hash256, Header, ProgramHash, Transaction, EMPTY_HASH};
use crate::store::ChainStore;

pub type TxCheck = Arc<dyn Fn(&Transaction) -> Result<(), String> + Send + Sync>;
pub type TxFee = Arc<dyn Fn(&Transaction, &Hash256) -> Fixed64 + Send + Sync>;

/// Immutable chain configuration, including the transaction validation
/// callbacks supplied by the surrounding node.
#[derive(Clone)]
pub struct Config {
    pub foundation: ProgramHash,
    pub asset_id: Hash256,
    pub pow_limit: BigUint,
    pub max_orphan_blocks: usize,
    pub min_memory_nodes: u32,
    pub check_tx_sanity: TxCheck,
    pub check_tx_context: TxCheck,
    pub get_tx_fee: TxFee,
}

impl Config {
    /// Defaults with pass-through validation callbacks; callers wire in
    /// the real transaction validators.
    pub fn new(foundation: ProgramHash, asset_id: Hash256) -> Self {
        Config {
            foundation,
            asset_id,
            pow_limit: pow_limit(),
            max_orphan_blocks: DEFAULT_MAX_ORPHAN_BLOCKS,
            min_memory_nodes: DEFAULT_MIN_MEMORY_NODES,
            check_tx_sanity: Arc::new(|_| Ok(())),
            check_tx_context: Arc::new(|_| Ok(())),
            get_tx_fee: Arc::new(|tx, _| tx.fee),
        }
    }
}

/// Everything guarded by the chain writer lock.
struct ChainState {
    tree: BlockTree,
    /// Bodies of side-chain blocks, needed if a reorg promotes them
    block_cache: HashMap<Hash256, Block>,
    median_time_past: u32,
}

pub struct BlockChain {
    store: Arc<dyn ChainStore>,
    config: Config,
    genesis_hash: Hash256,
    time_source: MedianTimeSource,
    events: EventBus,
    /// The chain mutex: serializes every mutating entry point
    state: RwLock<ChainState>,
    orphans: RwLock<OrphanPool>,
}

impl BlockChain {
    /// Open a chain over a store that already holds at least the genesis
    /// block, loading the most recent `min_memory_nodes` headers into the
    /// tree.
    pub fn new(config: Config, store: Arc<dyn ChainStore>) -> Result<Self, ChainError> {
        let genesis_hash = store.get_block_hash(0)?;

        let mut tree = BlockTree::new();
        let end_height = store.get_height();
        let start_height = end_height.saturating_sub(config.min_memory_nodes);
        let mut best = None;
        for height in start_height..=end_height {
            let hash = store.get_block_hash(height)?;
            let header = store.get_header(&hash)?;
            best = Some(tree.load_node(&header, &hash)?);
        }
        tree.set_best(best);
        let median_time_past = best.map(|id| tree.past_median_time(id)).unwrap_or(0);

        tracing::info!(
            "chain loaded: height={} tip={} nodes={}",
            end_height,
            hex::encode(store.get_current_block_hash()),
            tree.len(),
        );

        let max_orphan_blocks = config.max_orphan_blocks;
        Ok(BlockChain {
            store,
            config,
            genesis_hash,
            time_source: MedianTimeSource::new(),
            events: EventBus::new(),
            state: RwLock::new(ChainState {
                tree,
                block_cache: HashMap::new(),
                median_time_past,
            }),
            orphans: RwLock::new(OrphanPool::new(max_orphan_blocks)),
        })
    }

    // ─── Public API ─────────────────────────────────────────────────

    /// Run a block through the acceptance pipeline. Returns
    /// `(in_main_chain, is_orphan)`; an orphan result with no error means
    /// the block was parked awaiting its parent.
    pub fn add_block(&self, block: Block) -> Result<(bool, bool), ChainError> {
        let mut state = self.state.write();
        self.process_block(&mut state, block)
    }

    pub fn best_height(&self) -> u32 {
        let _state = self.state.read();
        self.store.get_height()
    }

    /// Hash of the best chain tip.
    pub fn best_block_hash(&self) -> Hash256 {
        let state = self.state.read();
        match state.tree.best() {
            Some(id) => state.tree.node(id).hash,
            None => self.store.get_current_block_hash(),
        }
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn median_time_past(&self) -> u32 {
        self.state.read().median_time_past
    }

    /// Timestamp for a new block candidate: network-adjusted now, floored
    /// to one second past the median time past.
    pub fn median_adjusted_time(&self) -> u32 {
        let state = self.state.read();
        let adjusted = self.time_source.adjusted_time();
        adjusted.max(u64::from(state.median_time_past) + 1) as u32
    }

    pub fn block_exists(&self, hash: &Hash256) -> bool {
        let state = self.state.read();
        self.block_exists_inner(&state, hash)
    }

    /// Whether the block is known anywhere: main chain, side chain, store
    /// or orphan pool.
    pub fn have_block(&self, hash: &Hash256) -> bool {
        self.block_exists(hash) || self.is_known_orphan(hash)
    }

    pub fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.read().is_known(hash)
    }

    /// Root of the orphan chain containing `hash`; peer sync requests the
    /// root's missing parent.
    pub fn get_orphan_root(&self, hash: &Hash256) -> Hash256 {
        self.orphans.read().root_of(hash)
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<Header, ChainError> {
        Ok(self.store.get_header(hash)?)
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Result<Block, ChainError> {
        Ok(self.store.get_block(hash)?)
    }

    pub fn get_block_hash(&self, height: u32) -> Result<Hash256, ChainError> {
        Ok(self.store.get_block_hash(height)?)
    }

    pub fn is_double_spend(&self, tx: &Transaction) -> bool {
        self.store.is_double_spend(tx)
    }

    pub fn is_duplicate_tx(&self, tx_id: &Hash256) -> bool {
        self.store.is_duplicate_tx(tx_id)
    }

    /// Required bits for the next block on the best chain.
    pub fn calc_next_required_difficulty(&self) -> u32 {
        let state = self.state.read();
        difficulty::calc_next_required_difficulty(&state.tree, state.tree.best(), &self.config.pow_limit)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn time_source(&self) -> &MedianTimeSource {
        &self.time_source
    }

    pub fn foundation(&self) -> ProgramHash {
        self.config.foundation
    }

    pub fn asset_id(&self) -> Hash256 {
        self.config.asset_id
    }

    pub fn tx_fee(&self, tx: &Transaction) -> Fixed64 {
        (self.config.get_tx_fee)(tx, &self.config.asset_id)
    }

    pub fn latest_block_locator(&self) -> Vec<Hash256> {
        let state = self.state.read();
        let tip = match state.tree.best() {
            Some(id) => state.tree.node(id).hash,
            None => self.store.get_current_block_hash(),
        };
        locator::block_locator_from_hash(&state.tree, self.store.as_ref(), &self.genesis_hash, &tip)
    }

    pub fn block_locator_from_hash(&self, hash: &Hash256) -> Vec<Hash256> {
        let state = self.state.read();
        locator::block_locator_from_hash(&state.tree, self.store.as_ref(), &self.genesis_hash, hash)
    }

    /// Main-chain hashes after the first known locator entry, bounded by
    /// `stop_hash` and `max_hashes`.
    pub fn locate_blocks(&self, locator: &[Hash256], stop_hash: &Hash256, max_hashes: u32) -> Vec<Hash256> {
        let _state = self.state.read();
        let start = locator::locate_start_block(self.store.as_ref(), locator);
        match locator::locate_blocks(self.store.as_ref(), &start, stop_hash, max_hashes) {
            Ok(hashes) => hashes,
            Err(e) => {
                tracing::error!("locate blocks failed: {}", e);
                Vec::new()
            }
        }
    }

    // ─── Acceptance pipeline ────────────────────────────────────────

    fn block_exists_inner(&self, state: &ChainState, hash: &Hash256) -> bool {
        // memory first (main or side chain), then the store for the rest
        // of the main chain
        state.tree.lookup(hash).is_some() || self.store.is_block_in_store(hash)
    }

    fn process_block(&self, state: &mut ChainState, block: Block) -> Result<(bool, bool), ChainError> {
        let block_hash = block.hash();
        tracing::trace!(
            "process block height={} hash={}",
            block.header.height,
            hex::encode(block_hash)
        );

        if self.block_exists_inner(state, &block_hash) {
            return Err(ChainError::AlreadyHave(Known::Block));
        }
        if self.orphans.read().is_known(&block_hash) {
            return Err(ChainError::AlreadyHave(Known::Orphan));
        }

        validator::check_block_sanity(&block, &self.config, &self.time_source)?;

        // Parent gate: park the block when its parent is unknown.
        let prev_hash = block.header.previous;
        if prev_hash != EMPTY_HASH && !self.block_exists_inner(state, &prev_hash) {
            tracing::debug!(
                "adding orphan block {} with parent {}",
                hex::encode(block_hash),
                hex::encode(prev_hash)
            );
            self.orphans.write().add(block);
            return Ok((false, true));
        }

        let in_main_chain = self.maybe_accept_block(state, &block)?;

        // Accept any orphans that were waiting on this block, cascading
        // until no more become connectable.
        self.process_orphans(state, &block_hash)?;

        Ok((in_main_chain, false))
    }

    fn maybe_accept_block(&self, state: &mut ChainState, block: &Block) -> Result<bool, ChainError> {
        let prev = self.prev_node_from_block(state, block)?;

        let expected_height = match prev {
            Some(id) => state.tree.node(id).height + 1,
            None => 0,
        };
        if block.header.height != expected_height {
            return Err(ChainError::WrongHeight {
                expected: expected_height,
                got: block.header.height,
            });
        }

        validator::check_block_context(block, &state.tree, prev, &self.config)?;

        // Drop nodes which are no longer needed before creating a new one.
        state.tree.prune(self.config.min_memory_nodes);

        let block_hash = block.hash();
        let id = state.tree.new_node(&block.header, block_hash);
        if let Some(parent) = prev {
            let parent_work = state.tree.node(parent).work_sum.clone();
            let node = state.tree.node_mut(id);
            node.parent = Some(parent);
            node.work_sum += parent_work;
        }

        let in_main_chain = self.connect_best_chain(state, id, block)?;

        self.events.notify(EventKind::BlockAccepted, block);
        Ok(in_main_chain)
    }

    fn process_orphans(&self, state: &mut ChainState, hash: &Hash256) -> Result<(), ChainError> {
        let mut queue = VecDeque::with_capacity(10);
        queue.push_back(*hash);
        while let Some(parent_hash) = queue.pop_front() {
            loop {
                let Some(block) = self.orphans.write().pop_child(&parent_hash) else {
                    break;
                };
                let orphan_hash = block.hash();
                tracing::debug!("processing orphan block {}", hex::encode(orphan_hash));
                self.maybe_accept_block(state, &block)?;
                queue.push_back(orphan_hash);
            }
        }
        Ok(())
    }

    /// Node for the block previous to `block`, lazily rehydrating it from
    /// the store. `None` means the genesis block was passed.
    fn prev_node_from_block(&self, state: &mut ChainState, block: &Block) -> Result<Option<NodeId>, ChainError> {
        let prev_hash = block.header.previous;
        if prev_hash == EMPTY_HASH {
            return Ok(None);
        }
        if let Some(id) = state.tree.lookup(&prev_hash) {
            return Ok(Some(id));
        }
        let header = self.store.get_header(&prev_hash)?;
        Ok(Some(state.tree.load_node(&header, &prev_hash)?))
    }

    /// Parent node of `id`, loading it from the store if the back-link was
    /// pruned. `None` means `id` is the genesis node.
    fn prev_node_from_node(&self, state: &mut ChainState, id: NodeId) -> Result<Option<NodeId>, ChainError> {
        if let Some(parent) = state.tree.node(id).parent {
            return Ok(Some(parent));
        }
        if state.tree.node(id).hash == self.genesis_hash {
            return Ok(None);
        }
        let parent_hash = state.tree.node(id).parent_hash;
        let header = self.store.get_header(&parent_hash)?;
        Ok(Some(state.tree.load_node(&header, &parent_hash)?))
    }

    // ─── Chain selection ────────────────────────────────────────────

    fn connect_best_chain(&self, state: &mut ChainState, id: NodeId, block: &Block) -> Result<bool, ChainError> {
        let best = state.tree.best();
        let parent = state.tree.node(id).parent;

        // Extending the best chain (or starting it) is the common case.
        if best.is_none() || parent == best {
            self.connect_block(state, id, block)?;
            if let Some(parent) = parent {
                state.tree.node_mut(parent).children.push(id);
            }
            return Ok(true);
        }
        let best = best.unwrap();

        // A side chain: keep the body around in case a reorg needs it.
        let block_hash = state.tree.node(id).hash;
        tracing::debug!("adding block {} to side chain cache", hex::encode(block_hash));
        state.block_cache.insert(block_hash, block.clone());
        state.tree.insert_index(block_hash, id);
        state.tree.node_mut(id).in_main_chain = false;
        let parent = parent.expect("side-chain node always has a parent");
        state.tree.node_mut(parent).children.push(id);

        if state.tree.node(id).work_sum <= state.tree.node(best).work_sum {
            // Not heavier: log how the block forks the chain and stop.
            let mut fork = id;
            loop {
                let node = state.tree.node(fork);
                if node.in_main_chain || node.parent.is_none() {
                    break;
                }
                fork = node.parent.unwrap();
            }
            let fork_node = state.tree.node(fork);
            if fork_node.hash == state.tree.node(parent).hash {
                tracing::info!(
                    "FORK: block {} forks the chain at height {}/block {}, but does not cause a reorganize",
                    hex::encode(block_hash),
                    fork_node.height,
                    hex::encode(fork_node.hash)
                );
            } else {
                tracing::info!(
                    "EXTEND FORK: block {} extends a side chain which forks the chain at height {}/block {}",
                    hex::encode(block_hash),
                    fork_node.height,
                    hex::encode(fork_node.hash)
                );
            }
            return Ok(false);
        }

        // The side chain is now the heaviest: swap the main-chain suffix
        // for it.
        let (detach, attach) = self.reorganize_nodes(state, id);
        tracing::info!("REORGANIZE: block {} is causing a reorganize", hex::encode(block_hash));
        self.reorganize_chain(state, &detach, &attach)?;
        Ok(true)
    }

    /// Find the fork point between the main chain and `id`. Returns the
    /// main-chain suffix to detach (tip first) and the side-chain branch
    /// to attach (ancestor first); the common ancestor is in neither list.
    fn reorganize_nodes(&self, state: &ChainState, id: NodeId) -> (Vec<NodeId>, Vec<NodeId>) {
        let tree = &state.tree;

        let mut attach = Vec::new();
        let mut ancestor = id;
        loop {
            let node = tree.node(ancestor);
            if node.parent.is_none() || node.in_main_chain {
                break;
            }
            attach.push(ancestor);
            ancestor = node.parent.unwrap();
        }
        attach.reverse();

        let ancestor_hash = tree.node(ancestor).hash;
        let mut detach = Vec::new();
        let mut cursor = tree.best();
        while let Some(node_id) = cursor {
            let node = tree.node(node_id);
            if node.parent.is_none() || node.hash == ancestor_hash {
                break;
            }
            detach.push(node_id);
            cursor = node.parent;
        }

        (detach, attach)
    }

    /// Execute a reorganization. The store transition is committed as one
    /// batch before any in-memory state is touched, so a store failure
    /// leaves both the tree and the best tip exactly where they were.
    fn reorganize_chain(&self, state: &mut ChainState, detach: &[NodeId], attach: &[NodeId]) -> Result<(), ChainError> {
        // Every block being attached must have its body staged.
        for id in attach {
            let hash = state.tree.node(*id).hash;
            if !state.block_cache.contains_key(&hash) {
                return Err(ChainError::MissingSideChainBody(hash));
            }
        }

        // Bodies of the blocks being detached come from the store; also
        // make sure each detach node still has its parent in memory.
        let mut detach_blocks = Vec::with_capacity(detach.len());
        let mut detach_hashes = Vec::with_capacity(detach.len());
        for id in detach {
            self.prev_node_from_node(state, *id)?;
            let hash = state.tree.node(*id).hash;
            detach_blocks.push(self.store.get_block(&hash)?);
            detach_hashes.push(hash);
        }

        let attach_blocks: Vec<Block> = attach
            .iter()
            .map(|id| state.block_cache[&state.tree.node(*id).hash].clone())
            .collect();

        self.store.commit_reorg(&detach_hashes, &attach_blocks)?;

        // The store agreed; now swing the in-memory chain and fire the
        // events in detach-then-attach order.
        for (id, block) in detach.iter().zip(&detach_blocks) {
            self.swing_disconnect(state, *id, block)?;
        }
        for (id, block) in attach.iter().zip(&attach_blocks) {
            self.ensure_extends(state, block)?;
            state.block_cache.remove(&state.tree.node(*id).hash);
            self.swing_connect(state, *id, block);
        }

        Ok(())
    }

    fn ensure_extends(&self, state: &ChainState, block: &Block) -> Result<(), ChainError> {
        if let Some(best) = state.tree.best() {
            if block.header.previous != state.tree.node(best).hash {
                return Err(ChainError::ConnectNotExtending);
            }
        }
        Ok(())
    }

    /// Connect a block to the end of the main chain: persist it, then make
    /// the node the new tip.
    fn connect_block(&self, state: &mut ChainState, id: NodeId, block: &Block) -> Result<(), ChainError> {
        self.ensure_extends(state, block)?;
        self.store.save_block(block)?;
        self.swing_connect(state, id, block);
        Ok(())
    }

    /// Flip the in-memory state for a connect. The store write has already
    /// happened; events fire synchronously under the chain writer lock.
    fn swing_connect(&self, state: &mut ChainState, id: NodeId, block: &Block) {
        let block_hash = state.tree.node(id).hash;
        state.tree.node_mut(id).in_main_chain = true;
        state.tree.insert_index(block_hash, id);
        state.tree.add_dep(block.header.previous, id);
        state.tree.set_best(Some(id));
        state.median_time_past = state.tree.past_median_time(id);

        self.events.notify(EventKind::BlockConnected, block);
        self.events.notify(EventKind::BlockPersistCompleted, block);
    }

    /// Flip the in-memory state for a disconnect: the node leaves the main
    /// chain, its body moves to the side-chain cache, and its parent
    /// becomes the tip.
    fn swing_disconnect(&self, state: &mut ChainState, id: NodeId, block: &Block) -> Result<(), ChainError> {
        match state.tree.best() {
            Some(best) if best == id => {}
            _ => return Err(ChainError::DisconnectNotTip),
        }

        let block_hash = state.tree.node(id).hash;
        state.tree.node_mut(id).in_main_chain = false;
        state.block_cache.insert(block_hash, block.clone());
        let parent = state.tree.node(id).parent;
        state.tree.set_best(parent);
        state.median_time_past = match parent {
            Some(parent) => state.tree.past_median_time(parent),
            None => 0,
        };

        self.events.notify(EventKind::BlockDisconnected, block);
        self.events.notify(EventKind::RollbackTransaction, block);
        Ok(())
    }

    #[cfg(test)]
    fn with_tree<R>(&self, f: impl FnOnce(&BlockTree) -> R) -> R {
        f(&self.state.read().tree)
    }
}
