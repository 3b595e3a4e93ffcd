//! CPU mining service: assembles block candidates from the mempool,
//! grinds the aux-pow parent header, and submits solved blocks back into
//! the chain. A ticker inside the nonce sweep watches for tip changes so
//! stale work is abandoned quickly.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use num_bigint::Sign;

use crate::chain::events::EventKind;
use crate::chain::BlockChain;
use crate::core::params::{BLOCK_VERSION, MAX_BLOCK_SIZE, MAX_TX_IN_BLOCK};
use crate::core::types::{
    is_finalized_transaction, Attribute, AttributeUsage, Block, Fixed64, Hash256, Header,
    ProgramHash, Transaction, EMPTY_HASH,
};
use crate::pow::auxpow::generate_side_aux_pow;
use crate::pow::{compact_to_big, hash_to_big};

/// Seconds between tip-change checks inside the nonce sweep
const HASH_UPDATE_SECS: u64 = 15;

/// The mempool and relay surface the miner talks to.
pub trait LocalNode: Send + Sync {
    fn txs_in_pool(&self) -> Vec<Transaction>;
    /// A block persisted; drop its transactions from the pool.
    fn clean_submitted(&self, block: &Block);
    fn maybe_accept_tx(&self, tx: &Transaction) -> Result<(), String>;
    fn remove_tx(&self, tx: &Transaction);
    fn relay(&self, block: &Block);
}

pub struct PowConfig {
    /// Program hash receiving the miner share of the fees
    pub pay_to: ProgramHash,
    /// Free-form data embedded in the coinbase payload
    pub miner_info: Vec<u8>,
    pub hash_update_interval: Duration,
}

impl Default for PowConfig {
    fn default() -> Self {
        PowConfig {
            pay_to: [0u8; 21],
            miner_info: b"auxchain".to_vec(),
            hash_update_interval: Duration::from_secs(HASH_UPDATE_SECS),
        }
    }
}

#[derive(Default)]
struct MiningFlags {
    started: bool,
    manual_mining: bool,
}

pub struct PowService {
    chain: Arc<BlockChain>,
    node: Arc<dyn LocalNode>,
    config: PowConfig,
    flags: Mutex<MiningFlags>,
    quit: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PowService {
    /// Create the service and wire up its chain-event subscriptions: a
    /// persisted block clears its transactions from the pool, and a
    /// rolled-back block's transactions are offered back to it.
    pub fn new(chain: Arc<BlockChain>, node: Arc<dyn LocalNode>, config: PowConfig) -> Arc<Self> {
        let pool = node.clone();
        chain.events().subscribe(EventKind::BlockPersistCompleted, move |block| {
            pool.clean_submitted(block);
        });

        let pool = node.clone();
        chain.events().subscribe(EventKind::RollbackTransaction, move |block| {
            for tx in &block.transactions[1..] {
                match pool.maybe_accept_tx(tx) {
                    Ok(()) => pool.remove_tx(tx),
                    Err(e) => tracing::error!("re-injecting rolled-back tx failed: {}", e),
                }
            }
        });

        Arc::new(PowService {
            chain,
            node,
            config,
            flags: Mutex::new(MiningFlags::default()),
            quit: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    // ─── Candidate assembly ─────────────────────────────────────────

    /// Build a block candidate on the current tip: a fee-funded coinbase
    /// followed by the highest-paying finalized mempool transactions that
    /// fit.
    pub fn generate_block(&self) -> Block {
        let next_height = self.chain.best_height() + 1;

        let mut coinbase = Transaction::new_coinbase(
            self.config.miner_info.clone(),
            next_height,
            self.chain.asset_id(),
            self.chain.foundation(),
            self.config.pay_to,
        );
        coinbase.attributes.push(Attribute {
            usage: AttributeUsage::Nonce,
            data: rand::random::<u64>().to_be_bytes().to_vec(),
        });

        let mut pool = self.node.txs_in_pool();
        pool.sort_by(|a, b| b.fee_per_kb.cmp(&a.fee_per_kb));

        let mut transactions = vec![coinbase];
        let mut total_size = transactions[0].size();
        let mut total_fee: Fixed64 = 0;
        for tx in pool {
            total_size += tx.size();
            if total_size > MAX_BLOCK_SIZE {
                break;
            }
            if transactions.len() >= MAX_TX_IN_BLOCK {
                break;
            }
            if !is_finalized_transaction(&tx, next_height) {
                continue;
            }
            let fee = self.chain.tx_fee(&tx);
            if fee != tx.fee {
                continue;
            }
            total_fee += fee;
            transactions.push(tx);
        }

        // fee split: 3/10 to the foundation, the rest to the miner
        let foundation_reward = total_fee * 3 / 10;
        transactions[0].outputs[0].value = foundation_reward;
        transactions[0].outputs[1].value = total_fee - foundation_reward;

        let mut block = Block {
            header: Header {
                version: BLOCK_VERSION,
                previous: self.chain.best_block_hash(),
                merkle_root: EMPTY_HASH,
                timestamp: self.chain.median_adjusted_time(),
                bits: self.chain.calc_next_required_difficulty(),
                nonce: 0,
                height: next_height,
                side_aux_pow: Default::default(),
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();

        tracing::debug!(
            "candidate block #{}: {} txs, fees {}, bits {:#010x}",
            next_height,
            block.transactions.len(),
            total_fee,
            block.header.bits,
        );
        block
    }

    // ─── Nonce search ───────────────────────────────────────────────

    /// Sweep the aux-pow parent nonce until the target is met, attaching
    /// the proof on success. Periodically re-checks the tip and gives up
    /// when the candidate no longer extends it.
    pub fn solve_block(&self, block: &mut Block) -> bool {
        let mut aux = generate_side_aux_pow(block.hash(), self.chain.genesis_hash());

        let target = compact_to_big(block.header.bits);
        if target.sign() != Sign::Plus {
            return false;
        }
        let target = target.to_biguint().unwrap();

        let interval = self.config.hash_update_interval;
        let mut last_check = Instant::now();
        for nonce in 0..=u32::MAX {
            if last_check.elapsed() >= interval {
                last_check = Instant::now();
                if block.header.previous != self.chain.best_block_hash() {
                    tracing::debug!("tip changed, abandoning candidate #{}", block.header.height);
                    return false;
                }
            }

            aux.parent_header.nonce = nonce;
            if hash_to_big(&aux.parent_header.hash()) <= target {
                block.header.side_aux_pow = aux.clone();
                return true;
            }
        }
        false
    }

    // ─── Mining loops ───────────────────────────────────────────────

    /// Spawn the continuous mining worker. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut flags = self.flags.lock();
        if flags.started || flags.manual_mining {
            tracing::debug!("cpu mining is already started");
            return;
        }
        flags.started = true;
        self.quit.store(false, Ordering::SeqCst);

        let service = self.clone();
        *self.worker.lock() = Some(std::thread::spawn(move || service.cpu_mining()));
    }

    /// Signal the worker and wait for it to exit its current cycle.
    pub fn halt(&self) {
        {
            let flags = self.flags.lock();
            if !flags.started || flags.manual_mining {
                return;
            }
        }
        tracing::info!("pow service stopping");
        self.quit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.flags.lock().started = false;
    }

    /// Mine `n` blocks synchronously and return their hashes.
    pub fn discrete_mining(&self, n: u32) -> Result<Vec<Hash256>, String> {
        {
            let mut flags = self.flags.lock();
            if flags.started || flags.manual_mining {
                return Err("server is already CPU mining".into());
            }
            flags.started = true;
            flags.manual_mining = true;
        }
        tracing::debug!("generating {} blocks", n);

        let mut hashes = Vec::with_capacity(n as usize);
        while hashes.len() < n as usize {
            let mut block = self.generate_block();
            if !self.solve_block(&mut block) {
                continue;
            }
            if block.header.height != self.chain.best_height() + 1 {
                continue;
            }
            match self.chain.add_block(block.clone()) {
                Ok((in_main, is_orphan)) => {
                    if is_orphan || !in_main {
                        continue;
                    }
                    self.node.relay(&block);
                    hashes.push(block.hash());
                }
                Err(e) => {
                    self.reset_flags();
                    return Err(e.to_string());
                }
            }
        }

        self.reset_flags();
        Ok(hashes)
    }

    fn reset_flags(&self) {
        let mut flags = self.flags.lock();
        flags.started = false;
        flags.manual_mining = false;
    }

    fn cpu_mining(&self) {
        loop {
            if self.quit.load(Ordering::Relaxed) {
                break;
            }

            let mut block = self.generate_block();
            if !self.solve_block(&mut block) {
                continue;
            }
            if block.header.height != self.chain.best_height() + 1 {
                continue;
            }
            match self.chain.add_block(block.clone()) {
                Ok((in_main, is_orphan)) => {
                    if is_orphan || !in_main {
                        continue;
                    }
                    tracing::info!(
                        "mined block #{} {}",
                        block.header.height,
                        hex::encode(block.hash())
                    );
                    self.node.relay(&block);
                }
                Err(e) => tracing::warn!("mined block rejected: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Config;
    use crate::core::params::genesis_block;
    use crate::core::types::{Input, OutPoint, Payload, TxType};
    use crate::store::memory::MemoryStore;
    use crate::store::ChainStore;
    use std::sync::atomic::AtomicUsize;

    const EASY_BITS: u32 = 0x207fffff;

    #[derive(Default)]
    struct StubNode {
        pool: Mutex<Vec<Transaction>>,
        relayed: Mutex<Vec<Hash256>>,
        cleaned: AtomicUsize,
    }

    impl LocalNode for StubNode {
        fn txs_in_pool(&self) -> Vec<Transaction> {
            self.pool.lock().clone()
        }
        fn clean_submitted(&self, _block: &Block) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
        fn maybe_accept_tx(&self, tx: &Transaction) -> Result<(), String> {
            self.pool.lock().push(tx.clone());
            Ok(())
        }
        fn remove_tx(&self, _tx: &Transaction) {}
        fn relay(&self, block: &Block) {
            self.relayed.lock().push(block.hash());
        }
    }

    fn transfer_tx(fee: Fixed64, fee_per_kb: Fixed64, lock_time: u32) -> Transaction {
        Transaction {
            tx_type: TxType::TransferAsset,
            payload_version: 0,
            payload: Payload::TransferAsset,
            attributes: Vec::new(),
            inputs: vec![Input {
                previous: OutPoint { tx_id: [fee as u8; 32], index: 0 },
                sequence: 0,
            }],
            outputs: Vec::new(),
            lock_time,
            fee,
            fee_per_kb,
        }
    }

    fn setup(config: Config) -> (Arc<BlockChain>, Arc<StubNode>, Arc<PowService>) {
        let store = Arc::new(MemoryStore::new());
        let mut genesis = genesis_block();
        genesis.header.bits = EASY_BITS;
        store.save_block(&genesis).unwrap();
        let chain = Arc::new(BlockChain::new(config, store).unwrap());
        let node = Arc::new(StubNode::default());
        let pow_config = PowConfig {
            pay_to: [0x11u8; 21],
            ..PowConfig::default()
        };
        let service = PowService::new(chain.clone(), node.clone(), pow_config);
        (chain, node, service)
    }

    fn fixed_fee_config(fee: Fixed64) -> Config {
        let mut config = Config::new([0xFDu8; 21], [0xA5u8; 32]);
        config.get_tx_fee = Arc::new(move |_, _| fee);
        config
    }

    #[test]
    fn test_generate_block_shape_and_fee_split() {
        // the validator prices every transaction at 50; the mismatched one
        // must be left out of the candidate
        let (_, node, service) = setup(fixed_fee_config(50));
        node.pool.lock().extend([
            transfer_tx(50, 10, 0),
            transfer_tx(50, 30, 0),
            transfer_tx(7, 99, 0),
        ]);

        let block = service.generate_block();
        assert_eq!(block.header.height, 1);
        assert!(block.validate_merkle_root());
        assert_eq!(block.header.bits, EASY_BITS);

        let coinbase = &block.transactions[0];
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.lock_time, 1);
        assert_eq!(coinbase.attributes.len(), 1);
        assert_eq!(coinbase.attributes[0].data.len(), 8);

        // two matching txs selected, highest fee rate first
        assert_eq!(block.transactions.len(), 3);
        assert_eq!(block.transactions[1].fee_per_kb, 30);
        assert_eq!(block.transactions[2].fee_per_kb, 10);

        // 100 in fees: 30 to the foundation, 70 to the miner
        assert_eq!(coinbase.outputs[0].value, 30);
        assert_eq!(coinbase.outputs[1].value, 70);
        assert_eq!(coinbase.outputs[0].program_hash, [0xFDu8; 21]);
        assert_eq!(coinbase.outputs[1].program_hash, [0x11u8; 21]);
    }

    #[test]
    fn test_non_final_tx_skipped() {
        let (_, node, service) = setup(fixed_fee_config(50));
        // locked at the candidate height: not final yet
        node.pool.lock().push(transfer_tx(50, 10, 1));
        let block = service.generate_block();
        assert_eq!(block.transactions.len(), 1);
    }

    #[test]
    fn test_solve_block_attaches_proof() {
        let (chain, _, service) = setup(fixed_fee_config(0));
        let mut block = service.generate_block();
        assert!(service.solve_block(&mut block));
        assert!(block.header.side_aux_pow.check(&block.hash(), block.header.bits));

        let (in_main, is_orphan) = chain.add_block(block).unwrap();
        assert!(in_main);
        assert!(!is_orphan);
        assert_eq!(chain.best_height(), 1);
    }

    #[test]
    fn test_solve_abandons_when_tip_moves() {
        let (_, _, base) = setup(fixed_fee_config(0));
        // rebuild the service with a zero interval so the tip check runs
        // on the first iteration
        let service = PowService {
            chain: base.chain.clone(),
            node: base.node.clone(),
            config: PowConfig {
                hash_update_interval: Duration::ZERO,
                ..PowConfig::default()
            },
            flags: Mutex::new(MiningFlags::default()),
            quit: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        };

        let mut block = service.generate_block();
        block.header.previous = [0xEEu8; 32];
        assert!(!service.solve_block(&mut block));
    }

    #[test]
    fn test_discrete_mining() {
        let (chain, node, service) = setup(fixed_fee_config(0));
        let hashes = service.discrete_mining(2).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(chain.best_height(), 2);
        assert_eq!(*node.relayed.lock(), hashes);
        // one persist notification per connected block
        assert_eq!(node.cleaned.load(Ordering::SeqCst), 2);
        // flags reset: a second run is allowed
        assert!(service.discrete_mining(1).is_ok());
    }
}
