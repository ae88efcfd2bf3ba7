use std::sync::{Arc, atomic::AtomicBool};

use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::{chain::BlockChain, error::Error, query::subs::SubscriptionHub};

pub mod initial;
pub mod pipeline;
pub mod stages;

use stages::index::Indexer;

const DEFAULT_WORKERS: usize = 8;
const DEFAULT_PREFETCH_WINDOW: u32 = 32;
const DEFAULT_BLOCK_ADDRESSES_TO_KEEP: u32 = 300;

/// Blocks behind the node tip above which startup goes through the
/// parallel bulk path before the ongoing pipeline takes over.
const BULK_SYNC_THRESHOLD: u32 = 100;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    /// Size of the initial-sync fetch worker pool.
    pub workers: Option<usize>,

    /// How far fetch workers may run ahead of the committer.
    pub prefetch_window: Option<u32>,

    /// How many trailing per-block undo records to retain.
    pub block_addresses_to_keep: Option<u32>,

    pub mempool: Option<bool>,

    pub stage_queue_size: Option<usize>,
    pub stage_timeout_secs: Option<u64>,
}

impl Config {
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(DEFAULT_WORKERS)
    }

    pub fn prefetch_window(&self) -> u32 {
        self.prefetch_window.unwrap_or(DEFAULT_PREFETCH_WINDOW)
    }

    pub fn block_addresses_to_keep(&self) -> u32 {
        self.block_addresses_to_keep
            .unwrap_or(DEFAULT_BLOCK_ADDRESSES_TO_KEEP)
    }

    pub fn mempool_enabled(&self) -> bool {
        self.mempool.unwrap_or(true)
    }
}

/// Runs sync to completion: a parallel bulk catch-up when far behind the
/// node, then the pull → index pipeline until shutdown.
pub fn run(
    config: &Config,
    chain: Arc<dyn BlockChain>,
    indexer: Arc<Indexer>,
    hub: Arc<SubscriptionHub>,
    cancel: Arc<AtomicBool>,
    shutdown_signals: Option<(broadcast::Receiver<()>, mpsc::Sender<()>)>,
) -> Result<(), Error> {
    let (tip_height, _) = chain.best_block()?;
    let local = indexer.best_block().map(|p| p.height);

    let start = match local {
        Some(height) => height + 1,
        None => 0,
    };

    if tip_height >= start && tip_height - start >= BULK_SYNC_THRESHOLD {
        indexer.set_initial_sync(true);
        initial::connect_blocks_parallel(
            &indexer,
            chain.as_ref(),
            start,
            tip_height,
            config.workers(),
            config.prefetch_window(),
            &cancel,
        )?;
        info!("bulk sync finished at height {tip_height}");
    }

    pipeline::pipeline(config, chain, indexer, hub, shutdown_signals)?.block();

    Ok(())
}
