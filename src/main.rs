//! Lithe node
//!
//! Opens the chain, serves JSON-RPC, and optionally mines on local threads.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lithe_core::config::{ConfigOverrides, NodeConfig};
use lithe_core::crypto::PublicKey;
use lithe_core::mining::{Miner, MiningResult};
use lithe_core::node::{AddBlockResult, Core, CoreEvent, SystemClock};
use lithe_core::rpc::{start_rpc_server, RpcState};

/// Lithe consensus and transaction-pool node.
#[derive(Parser, Debug)]
#[command(name = "lithe-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "lithe.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Network to run (mainnet, testnet)
    #[arg(short, long)]
    network: Option<String>,

    /// Enable internal CPU mining
    #[arg(long)]
    mining: bool,

    /// Number of mining threads (0 = auto-detect)
    #[arg(long, default_value = "0")]
    mining_threads: usize,

    /// Mining reward address
    #[arg(long)]
    mining_address: Option<String>,

    /// RPC bind address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            network: self.network.clone(),
            data_dir: self.data_dir.clone(),
            rpc_bind: self.rpc_bind.clone(),
            log_level: self.log_level.clone(),
            mining: self.mining,
            mining_threads: self.mining_threads,
            mining_address: self.mining_address.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(&args.config, &args.overrides())?;

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Lithe node v{}", env!("CARGO_PKG_VERSION"));
    info!("Network: {}", config.network);
    info!("Data directory: {:?}", config.data_dir);

    let currency = Arc::new(config.currency()?);
    let db_path = config.data_dir.join(lithe_core::constants::BLOCKS_FILENAME);
    let core = Arc::new(
        Core::open(currency, &db_path, Arc::new(SystemClock))
            .with_context(|| format!("failed to open chain at {:?}", db_path))?,
    );
    info!(height = core.top_height(), top = %core.top_hash(), "chain loaded");

    spawn_event_logger(&core);
    spawn_maintenance(&core, &config);

    if config.rpc.enabled {
        let state = Arc::new(RpcState {
            core: core.clone(),
            allow_admin: config.rpc.enable_admin,
        });
        let addr = config.rpc_address()?;
        tokio::spawn(async move {
            if let Err(e) = start_rpc_server(state, addr).await {
                error!("RPC server error: {}", e);
            }
        });
    }

    let miner = match config.reward_key()? {
        Some(key) if config.mining.enabled => {
            let miner = Miner::new(key);
            let threads = match config.mining.threads {
                0 => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
                n => n,
            };
            info!(address = %key.to_address(), threads, "mining enabled");
            spawn_mining(core.clone(), miner.clone(), threads);
            Some(miner)
        }
        _ => None,
    };

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");
    if let Some(miner) = miner {
        miner.stop();
    }
    let flushed = tokio::task::spawn_blocking(move || core.flush()).await?;
    if let Err(e) = flushed {
        error!("failed to flush storage: {}", e);
    }
    info!("Lithe node stopped");
    Ok(())
}

/// Log every core event
fn spawn_event_logger(core: &Arc<Core>) {
    let mut events = core.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CoreEvent::ChainSwitched {
                    fork_height,
                    top_height,
                    ..
                }) => info!(fork_height, top_height, "switched to alternative chain"),
                Ok(event) => debug!(?event, "core event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event logger lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Periodic pool expiry and snapshot
fn spawn_maintenance(core: &Arc<Core>, config: &NodeConfig) {
    let evict_every = Duration::from_secs(config.pool.eviction_interval_secs.max(1));
    let flush_every = Duration::from_secs(config.pool.flush_interval_secs.max(1));
    let core = core.clone();
    tokio::spawn(async move {
        let mut evict = tokio::time::interval(evict_every);
        let mut flush = tokio::time::interval(flush_every);
        loop {
            let core = core.clone();
            tokio::select! {
                _ = evict.tick() => {
                    match tokio::task::spawn_blocking(move || core.evict_expired()).await {
                        Ok(Ok(removed)) if !removed.is_empty() => info!(count = removed.len(), "evicted pool transactions"),
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("pool eviction failed: {}", e),
                        Err(e) => error!("eviction task failed: {}", e),
                    }
                }
                _ = flush.tick() => {
                    match tokio::task::spawn_blocking(move || core.flush()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("flush failed: {}", e),
                        Err(e) => error!("flush task failed: {}", e),
                    }
                }
            }
        }
    });
}

/// Mine on `threads` workers, restarting whenever the tip moves
fn spawn_mining(core: Arc<Core>, miner: Miner, threads: usize) {
    let mut events = core.subscribe();
    let watcher = miner.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CoreEvent::BlockAdded { .. })
                | Ok(CoreEvent::ChainSwitched { .. })
                | Ok(CoreEvent::ChainRolledBack { .. }) => watcher.stop(),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        let reward_key: PublicKey = miner.reward_key();
        loop {
            let template = match core.build_block_template_for_key(reward_key) {
                Ok(template) => template,
                Err(e) => {
                    error!("failed to build block template: {}", e);
                    if core.is_halted() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            miner.reset();
            let (tx, mut rx) = tokio::sync::mpsc::channel(threads);
            for i in 0..threads {
                let m = miner.clone();
                let tx_worker = tx.clone();
                let mut block = template.block.clone();
                // disjoint nonce ranges per worker
                block.header.nonce = i as u64 * (u64::MAX / threads as u64);
                tokio::task::spawn_blocking(move || {
                    let _ = tx_worker.blocking_send(m.mine_block(block));
                });
            }
            drop(tx);

            let mut found = None;
            while let Some(result) = rx.recv().await {
                if let MiningResult::Success(block) = result {
                    found = Some(block);
                    miner.stop();
                    break;
                }
            }

            let Some(block) = found else {
                continue;
            };
            let core = core.clone();
            match tokio::task::spawn_blocking(move || core.add_block_parsed(block)).await {
                Ok(Ok(AddBlockResult::Accepted { hash, height })) => {
                    info!(height, %hash, "mined block");
                }
                Ok(Ok(other)) => debug!(?other, "mined block not on main chain"),
                Ok(Err(e)) => warn!("mined block rejected: {}", e),
                Err(e) => error!("mining task failed: {}", e),
            }
        }
    });
}
