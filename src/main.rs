use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use auxchain::chain::{BlockChain, Config};
use auxchain::core::params::genesis_asset_id;
use auxchain::core::params::genesis_block;
use auxchain::core::types::{Block, ProgramHash, Transaction};
use auxchain::miner::{LocalNode, PowConfig, PowService};
use auxchain::store::sled::SledStore;
use auxchain::store::ChainStore;

const DEFAULT_DATA_DIR: &str = "auxchain_data";

/// Default destination for the foundation share of the fees
const FOUNDATION: ProgramHash = [0x21u8; 21];

#[derive(Parser)]
#[command(name = "auxchain", version)]
#[command(about = "AuxPoW side-chain node: block tree, chain selection, mining")]
struct Cli {
    /// Data directory for the block store
    #[arg(long, global = true)]
    data_dir: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and persist the genesis block
    Init,
    /// Show chain state
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Mine a number of blocks, then exit
    Mine {
        #[arg(default_value_t = 1)]
        count: u32,
        /// Miner payout program hash (42 hex chars)
        #[arg(long)]
        pay_to: Option<String>,
    },
    /// Run the node with the CPU miner
    Node {
        #[arg(long)]
        pay_to: Option<String>,
    },
}

/// In-process mempool and relay stand-in: the networking layer plugs in
/// here in a full deployment.
#[derive(Default)]
struct StandaloneNode {
    pool: Mutex<Vec<Transaction>>,
}

impl LocalNode for StandaloneNode {
    fn txs_in_pool(&self) -> Vec<Transaction> {
        self.pool.lock().clone()
    }

    fn clean_submitted(&self, block: &Block) {
        let submitted: Vec<_> = block.transactions.iter().map(|tx| tx.hash()).collect();
        self.pool.lock().retain(|tx| !submitted.contains(&tx.hash()));
    }

    fn maybe_accept_tx(&self, tx: &Transaction) -> Result<(), String> {
        let mut pool = self.pool.lock();
        if pool.iter().any(|known| known.hash() == tx.hash()) {
            return Err("transaction already in pool".into());
        }
        pool.push(tx.clone());
        Ok(())
    }

    fn remove_tx(&self, tx: &Transaction) {
        let hash = tx.hash();
        self.pool.lock().retain(|known| known.hash() != hash);
    }

    fn relay(&self, block: &Block) {
        tracing::debug!("relay block {} (no peers attached)", hex::encode(block.hash()));
    }
}

fn open_chain(data_dir: &str) -> (Arc<SledStore>, Arc<BlockChain>) {
    std::fs::create_dir_all(data_dir).unwrap_or_else(|e| {
        eprintln!("cannot create {}: {}", data_dir, e);
        std::process::exit(1);
    });
    let store = SledStore::open(data_dir).unwrap_or_else(|e| {
        eprintln!("cannot open store: {}", e);
        std::process::exit(1);
    });
    if !store.has_chain_data() {
        let genesis = genesis_block();
        store.save_block(&genesis).unwrap_or_else(|e| {
            eprintln!("cannot persist genesis: {}", e);
            std::process::exit(1);
        });
        tracing::info!("stored genesis block {}", hex::encode(genesis.hash()));
    }
    let store = Arc::new(store);
    let config = Config::new(FOUNDATION, genesis_asset_id());
    let chain = BlockChain::new(config, store.clone()).unwrap_or_else(|e| {
        eprintln!("cannot open chain: {}", e);
        std::process::exit(1);
    });
    (store, Arc::new(chain))
}

fn parse_pay_to(arg: Option<String>) -> ProgramHash {
    let Some(arg) = arg else { return [0u8; 21] };
    match hex::decode(&arg) {
        Ok(bytes) if bytes.len() == 21 => {
            let mut hash = [0u8; 21];
            hash.copy_from_slice(&bytes);
            hash
        }
        _ => {
            eprintln!("invalid pay-to program hash: {}", arg);
            std::process::exit(1);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("auxchain=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());

    match cli.command {
        Commands::Init => {
            let (store, chain) = open_chain(&data_dir);
            println!("auxchain initialized");
            println!("  data:    {}", data_dir);
            println!("  height:  {}", store.get_height());
            println!("  genesis: {}", hex::encode(chain.genesis_hash()));
        }

        Commands::Info { json } => {
            let (store, chain) = open_chain(&data_dir);
            let height = store.get_height();
            let tip = chain.best_block_hash();
            if json {
                let info = serde_json::json!({
                    "height": height,
                    "tip": hex::encode(tip),
                    "genesis": hex::encode(chain.genesis_hash()),
                    "median_time_past": chain.median_time_past(),
                    "next_bits": format!("{:#010x}", chain.calc_next_required_difficulty()),
                });
                println!("{}", serde_json::to_string_pretty(&info).unwrap());
            } else {
                println!("height:     {}", height);
                println!("tip:        {}", hex::encode(tip));
                println!("genesis:    {}", hex::encode(chain.genesis_hash()));
                println!("mtp:        {}", chain.median_time_past());
                println!("next bits:  {:#010x}", chain.calc_next_required_difficulty());
            }
        }

        Commands::Mine { count, pay_to } => {
            let (_, chain) = open_chain(&data_dir);
            let node = Arc::new(StandaloneNode::default());
            let service = PowService::new(
                chain.clone(),
                node,
                PowConfig {
                    pay_to: parse_pay_to(pay_to),
                    ..PowConfig::default()
                },
            );
            match service.discrete_mining(count) {
                Ok(hashes) => {
                    for (i, hash) in hashes.iter().enumerate() {
                        println!("  #{}: {}", i + 1, hex::encode(hash));
                    }
                    println!("mined {} blocks, height {}", hashes.len(), chain.best_height());
                }
                Err(e) => {
                    eprintln!("mining failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Node { pay_to } => {
            let (store, chain) = open_chain(&data_dir);
            let node = Arc::new(StandaloneNode::default());
            let service = PowService::new(
                chain.clone(),
                node,
                PowConfig {
                    pay_to: parse_pay_to(pay_to),
                    ..PowConfig::default()
                },
            );

            println!("auxchain node");
            println!("  data:    {}", data_dir);
            println!("  height:  {}", store.get_height());
            println!("  tip:     {}", hex::encode(chain.best_block_hash()));

            let stop = Arc::new(AtomicBool::new(false));
            let stop_handler = stop.clone();
            ctrlc::set_handler(move || {
                println!("\nshutting down...");
                stop_handler.store(true, Ordering::SeqCst);
            })
            .expect("ctrl-c handler");

            service.start();

            let mut last_status = std::time::Instant::now();
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
                if last_status.elapsed() >= Duration::from_secs(30) {
                    last_status = std::time::Instant::now();
                    tracing::info!(
                        "height={} tip={} bits={:#010x}",
                        chain.best_height(),
                        hex::encode(chain.best_block_hash()),
                        chain.calc_next_required_difficulty(),
                    );
                }
            }

            service.halt();
            tracing::info!("shutdown complete, height={}", chain.best_height());
        }
    }
}
