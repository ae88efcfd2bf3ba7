use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    chain::{ChainParser, bitcoin::BitcoinParser, rpc::{NodeConfig, RpcChain}},
    query::{QueryEngine, subs::SubscriptionHub},
    shutdown::ShutdownManager,
    storage::{kv_store::Store, tx_cache::TxCache},
    sync::stages::index::Indexer,
};

pub use storage::encdec::{DecodingError, DecodingResult};

mod chain;
mod error;
mod query;
mod serve;
mod shutdown;
mod storage;
mod sync;

pub use error::Error;

#[derive(Debug, Subcommand)]
enum Command {
    /// Index blocks from the node until interrupted.
    Sync(SyncArgs),
    /// Serve queries and subscriptions over an existing index.
    Serve(ServeArgs),
    /// Sync and serve in one process.
    Run(RunArgs),
    /// Disconnect indexed blocks down to a given height.
    Rollback(RollbackArgs),
}

#[derive(Debug, clap::Args)]
pub struct SyncArgs {}

#[derive(Debug, clap::Args)]
pub struct ServeArgs {}

#[derive(Debug, clap::Args)]
pub struct RunArgs {}

#[derive(Debug, clap::Args)]
pub struct RollbackArgs {
    /// Height the index should be at after the rollback.
    #[arg(long)]
    height: u32,

    /// Reconstruct the undo data by scanning the addresses column; needed
    /// when the per-block undo records have aged out of retention.
    #[arg(long)]
    full_scan: bool,
}

#[derive(Debug, Parser)]
#[clap(name = "lodestone")]
#[clap(bin_name = "lodestone")]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    config: Option<std::path::PathBuf>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub db_path: Option<String>,
    pub coin: String,
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: storage::Config,
    #[serde(default)]
    pub sync: sync::Config,
    pub server: Option<serve::ServerConfig>,
}

impl Config {
    pub fn new(config_path: &Option<std::path::PathBuf>) -> Result<Self, config::ConfigError> {
        let mut s = config::Config::builder();

        s = s.add_source(config::File::with_name("lodestone.toml").required(false));

        if let Some(explicit) = config_path.as_ref().and_then(|x| x.to_str()) {
            s = s.add_source(config::File::with_name(explicit).required(true));
        }

        s = s.add_source(config::Environment::with_prefix("LODESTONE").separator("_"));

        s.build()?.try_deserialize()
    }
}

struct Components {
    chain: Arc<RpcChain>,
    indexer: Arc<Indexer>,
    tx_cache: Arc<TxCache>,
    query: Arc<QueryEngine>,
    hub: Arc<SubscriptionHub>,
}

fn build(config: &Config) -> Result<Components, Error> {
    let parser: Arc<dyn ChainParser> = Arc::new(BitcoinParser::new(&config.coin)?);

    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| "./data/lodestone".into());
    info!("using db path '{db_path}'");

    let store = Arc::new(Store::open(
        db_path.into(),
        config.storage.rocksdb_memory_budget_bytes(),
    )?);

    let chain = RpcChain::new(&config.node, parser.clone())?;
    chain.start_notifier();

    let indexer = Arc::new(Indexer::new(
        store.clone(),
        parser.clone(),
        config.sync.block_addresses_to_keep(),
    )?);

    let chain_dyn: Arc<dyn chain::BlockChain> = chain.clone();
    let tx_cache = Arc::new(TxCache::new(store.clone(), chain_dyn.clone(), parser, true));
    let query = Arc::new(QueryEngine::new(
        indexer.clone(),
        chain_dyn,
        tx_cache.clone(),
    ));
    let hub = Arc::new(SubscriptionHub::new());

    tokio::spawn(storage::stats_logger::start_stats_logger(store));

    Ok(Components {
        chain,
        indexer,
        tx_cache,
        query,
        hub,
    })
}

fn spawn_sync(
    config: &Config,
    components: &Components,
    shutdown: &ShutdownManager,
) -> (tokio::task::JoinHandle<()>, mpsc::Receiver<()>) {
    let sync_config = config.sync.clone();
    let chain: Arc<dyn chain::BlockChain> = components.chain.clone();
    let indexer = components.indexer.clone();
    let hub = components.hub.clone();
    let cancel = shutdown.flag();
    let should_shutdown = shutdown.subscribe();

    let (has_shutdown_tx, has_shutdown_rx) = mpsc::channel(1);

    let handle = tokio::task::spawn_blocking(move || {
        let result = sync::run(
            &sync_config,
            chain,
            indexer,
            hub,
            cancel,
            Some((should_shutdown, has_shutdown_tx)),
        );

        if let Err(e) = result {
            error!("sync stopped: {e}");
        }
    });

    (handle, has_shutdown_rx)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let args = Cli::parse();
    let config = Config::new(&args.config).map_err(|e| Error::Config(e.to_string()))?;

    let shutdown = ShutdownManager::new();
    let components = build(&config)?;

    let serve_address = config
        .server
        .as_ref()
        .and_then(|s| s.address.clone())
        .unwrap_or_else(|| serve::DEFAULT_SERVE_ADDRESS.to_string());

    match args.command {
        Command::Sync(_) => {
            info!("running lodestone in sync mode");

            let (sync_task, mut has_shutdown) = spawn_sync(&config, &components, &shutdown);
            let _ = has_shutdown.recv().await;
            let _ = sync_task.await;
        }
        Command::Serve(_) => {
            info!("running lodestone in serve mode");

            serve::run(components.query, components.hub, &serve_address).await?;
        }
        Command::Run(_) => {
            info!("running lodestone in sync+serve mode");

            let (sync_task, _has_shutdown) = spawn_sync(&config, &components, &shutdown);

            let serve_result = serve::run(
                components.query.clone(),
                components.hub.clone(),
                &serve_address,
            )
            .await;

            sync_task.abort();

            info!("serve stage ended: {serve_result:?}");
        }
        Command::Rollback(args) => {
            let best = components
                .indexer
                .best_block()
                .ok_or_else(|| Error::invalid("index is empty"))?;

            info!(
                "rolling back from {} to {} (full scan: {})",
                best.height, args.height, args.full_scan
            );

            let indexer = components.indexer.clone();
            let tx_cache = components.tx_cache.clone();
            tokio::task::spawn_blocking(move || {
                if args.full_scan {
                    indexer.disconnect_block_range_full_scan(
                        args.height + 1,
                        best.height,
                        &tx_cache,
                    )
                } else {
                    indexer.disconnect_block_range(args.height + 1, best.height)
                }
            })
            .await
            .map_err(|e| Error::internal(e))??;
        }
    }

    Ok(())
}
