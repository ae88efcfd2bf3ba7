use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bitcoin::hashes::Hash;
use bitcoincore_rpc::{Client, RpcApi, json::EstimateMode, jsonrpc};
use num_bigint::BigUint;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::{
    chain::{
        Block, BlockChain, BlockHash, BlockHeader, ChainParser, MempoolEntry, NodeNotification,
        OutPoint, Tx, Txid, Vin, Vout,
    },
    error::Error,
};

/// Deadline applied to every node RPC call.
const RPC_DEADLINE: Duration = Duration::from_secs(60);

/// Transient transport failures are retried this many times with a linear
/// backoff before surfacing a `Backend` error.
const RPC_RETRIES: u32 = 3;

/// How long a mempool address snapshot stays fresh before the next
/// `get_mempool_transactions` triggers a refresh.
const MEMPOOL_REFRESH: Duration = Duration::from_secs(2);

const NOTIFICATION_POLL: Duration = Duration::from_secs(2);

#[derive(Deserialize, Debug, Clone)]
pub struct NodeConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_pass: String,
}

/// `BlockChain` implementation backed by a bitcoind-compatible JSON-RPC
/// node. Mempool address lookups are served from a periodically rebuilt
/// in-memory map; new-block and new-tx notifications are emitted by a
/// polling task.
pub struct RpcChain {
    client: Client,
    parser: Arc<dyn ChainParser>,
    notifications: broadcast::Sender<NodeNotification>,
    mempool: Mutex<MempoolIndex>,
}

#[derive(Default)]
struct MempoolIndex {
    txids: HashSet<Txid>,
    by_descriptor: HashMap<Vec<u8>, Vec<Txid>>,
    refreshed: Option<Instant>,
}

impl RpcChain {
    pub fn new(config: &NodeConfig, parser: Arc<dyn ChainParser>) -> Result<Arc<Self>, Error> {
        let transport = jsonrpc::simple_http::SimpleHttpTransport::builder()
            .url(&config.rpc_url)
            .map_err(Error::backend)?
            .timeout(RPC_DEADLINE)
            .auth(&config.rpc_user, Some(&config.rpc_pass))
            .build();

        let client = Client::from_jsonrpc(jsonrpc::Client::with_transport(transport));
        let (notifications, _) = broadcast::channel(256);

        Ok(Arc::new(Self {
            client,
            parser,
            notifications,
            mempool: Mutex::new(MempoolIndex::default()),
        }))
    }

    /// Spawns the polling task feeding `notifications`.
    pub fn start_notifier(self: &Arc<Self>) {
        let chain = self.clone();

        tokio::spawn(async move {
            let mut last_best: Option<(u32, BlockHash)> = None;
            let mut seen_txids: HashSet<Txid> = HashSet::new();
            let mut ticker = tokio::time::interval(NOTIFICATION_POLL);

            loop {
                ticker.tick().await;

                let polled = tokio::task::block_in_place(|| {
                    let best = chain.best_block()?;
                    let mempool = chain.raw_mempool()?;
                    Ok::<_, Error>((best, mempool))
                });

                let ((height, hash), mempool) = match polled {
                    Ok(polled) => polled,
                    Err(e) => {
                        warn!("node poll failed: {e}");
                        continue;
                    }
                };

                if last_best != Some((height, hash)) {
                    last_best = Some((height, hash));
                    let _ = chain
                        .notifications
                        .send(NodeNotification::NewBlock { height, hash });
                }

                for txid in &mempool {
                    if seen_txids.insert(*txid) {
                        let _ = chain.notifications.send(NodeNotification::NewTx(*txid));
                    }
                }
                seen_txids.retain(|txid| mempool.contains(txid));
            }
        });
    }

    fn retrying<T>(
        &self,
        what: &str,
        call: impl Fn(&Client) -> Result<T, bitcoincore_rpc::Error>,
    ) -> Result<T, Error> {
        let mut attempt = 0;
        loop {
            match call(&self.client) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= RPC_RETRIES || !is_transient(&err) {
                        return Err(Error::Backend(format!("{what}: {err}")));
                    }
                    debug!("retrying {what} after transport error: {err}");
                    std::thread::sleep(Duration::from_millis(200 * attempt as u64));
                }
            }
        }
    }

    fn raw_mempool(&self) -> Result<HashSet<Txid>, Error> {
        let txids = self.retrying("getrawmempool", |c| c.get_raw_mempool())?;
        Ok(txids.iter().map(txid_bytes).collect())
    }

    /// Rebuilds the mempool address map when stale. Per-tx failures are
    /// logged and the offending tx skipped; they never fail the caller.
    fn refresh_mempool(&self) -> Result<(), Error> {
        {
            let index = self.mempool.lock().expect("mempool lock poisoned");
            if index
                .refreshed
                .is_some_and(|at| at.elapsed() < MEMPOOL_REFRESH)
            {
                return Ok(());
            }
        }

        let current = self.raw_mempool()?;

        let mut fresh = MempoolIndex {
            refreshed: Some(Instant::now()),
            ..Default::default()
        };

        for txid in current {
            fresh.txids.insert(txid);

            let (tx, _) = match self.get_transaction(&txid) {
                Ok(found) => found,
                Err(e) => {
                    error!("mempool tx {}: {e}", hex::encode(txid));
                    continue;
                }
            };

            let mut descriptors = HashSet::new();
            for vout in &tx.vout {
                descriptors.insert(self.parser.script_to_descriptor(&vout.script));
            }
            for vin in &tx.vin {
                let Some(prevout) = &vin.prevout else { continue };
                match self.get_transaction(&prevout.txid) {
                    Ok((prev, _)) => {
                        if let Some(spent) = prev.vout.get(prevout.vout as usize) {
                            descriptors.insert(self.parser.script_to_descriptor(&spent.script));
                        }
                    }
                    Err(e) => error!("mempool prev tx {}: {e}", hex::encode(prevout.txid)),
                }
            }

            for descriptor in descriptors {
                fresh.by_descriptor.entry(descriptor).or_default().push(txid);
            }
        }

        *self.mempool.lock().expect("mempool lock poisoned") = fresh;
        Ok(())
    }
}

impl BlockChain for RpcChain {
    fn best_block(&self) -> Result<(u32, BlockHash), Error> {
        let hash = self.retrying("getbestblockhash", |c| c.get_best_block_hash())?;
        let info = self.retrying("getblockheader", |c| c.get_block_header_info(&hash))?;
        Ok((info.height as u32, hash_bytes(&hash)))
    }

    fn get_block_hash(&self, height: u32) -> Result<BlockHash, Error> {
        let hash = self.retrying("getblockhash", |c| c.get_block_hash(height as u64))?;
        Ok(hash_bytes(&hash))
    }

    fn get_block(&self, height: u32, hash: Option<&BlockHash>) -> Result<Block, Error> {
        let hash = match hash {
            Some(hash) => bitcoin::BlockHash::from_byte_array(reversed(hash)),
            None => self.retrying("getblockhash", |c| c.get_block_hash(height as u64))?,
        };

        let block = self.retrying("getblock", |c| c.get_block(&hash))?;

        let header = BlockHeader {
            height,
            hash: hash_bytes(&hash),
            prev_hash: hash_bytes(&block.header.prev_blockhash),
            time: block.header.time as i64,
            size: block.total_size() as u32,
        };

        let time = header.time;
        let txs = block
            .txdata
            .into_iter()
            .map(|tx| convert_tx(&tx, time))
            .collect();

        Ok(Block { header, txs })
    }

    fn get_block_header(&self, hash: &BlockHash) -> Result<BlockHeader, Error> {
        let hash = bitcoin::BlockHash::from_byte_array(reversed(hash));
        let info = self.retrying("getblockheader", |c| c.get_block_header_info(&hash))?;

        Ok(BlockHeader {
            height: info.height as u32,
            hash: hash_bytes(&hash),
            prev_hash: info
                .previous_block_hash
                .map(|h| hash_bytes(&h))
                .unwrap_or_default(),
            time: info.time as i64,
            size: 0,
        })
    }

    fn get_transaction(&self, txid: &Txid) -> Result<(Tx, Option<u32>), Error> {
        let rpc_txid = bitcoin::Txid::from_byte_array(reversed(txid));
        let info = self.retrying("getrawtransaction", |c| {
            c.get_raw_transaction_info(&rpc_txid, None)
        })?;

        let tx = info
            .transaction()
            .map_err(|e| Error::Backend(format!("getrawtransaction decode: {e}")))?;

        let height = match info.blockhash {
            Some(blockhash) => {
                let header = self.retrying("getblockheader", |c| {
                    c.get_block_header_info(&blockhash)
                })?;
                Some(header.height as u32)
            }
            None => None,
        };

        Ok((convert_tx(&tx, info.blocktime.unwrap_or(0) as i64), height))
    }

    fn get_mempool_transactions(&self, descriptor: &[u8]) -> Result<Vec<Txid>, Error> {
        self.refresh_mempool()?;

        let index = self.mempool.lock().expect("mempool lock poisoned");
        Ok(index
            .by_descriptor
            .get(descriptor)
            .cloned()
            .unwrap_or_default())
    }

    fn get_mempool_entry(&self, txid: &Txid) -> Result<MempoolEntry, Error> {
        let rpc_txid = bitcoin::Txid::from_byte_array(reversed(txid));
        let entry = self.retrying("getmempoolentry", |c| c.get_mempool_entry(&rpc_txid))?;

        Ok(MempoolEntry {
            vsize: entry.vsize as u32,
            fee_sat: BigUint::from(entry.fees.base.to_sat()),
            time: entry.time as i64,
        })
    }

    fn send_raw_transaction(&self, hex: &str) -> Result<Txid, Error> {
        let txid = self.retrying("sendrawtransaction", |c| c.send_raw_transaction(hex))?;
        Ok(txid_bytes(&txid))
    }

    fn estimate_fee(&self, blocks: u16) -> Result<BigUint, Error> {
        // the legacy estimatefee call is gone from modern nodes
        self.estimate_smart_fee(blocks, false)
    }

    fn estimate_smart_fee(&self, blocks: u16, conservative: bool) -> Result<BigUint, Error> {
        let mode = if conservative {
            EstimateMode::Conservative
        } else {
            EstimateMode::Economical
        };

        let estimate = self.retrying("estimatesmartfee", |c| {
            c.estimate_smart_fee(blocks, Some(mode))
        })?;

        let rate = estimate
            .fee_rate
            .ok_or_else(|| Error::backend("fee estimation unavailable"))?;

        Ok(BigUint::from(rate.to_sat()))
    }

    fn notifications(&self) -> broadcast::Receiver<NodeNotification> {
        self.notifications.subscribe()
    }
}

fn is_transient(err: &bitcoincore_rpc::Error) -> bool {
    matches!(err, bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Transport(_)))
}

/// Display-order bytes of a node-side txid.
fn txid_bytes(txid: &bitcoin::Txid) -> Txid {
    reversed(&txid.to_byte_array())
}

fn hash_bytes(hash: &bitcoin::BlockHash) -> BlockHash {
    reversed(&hash.to_byte_array())
}

fn reversed(bytes: &[u8; 32]) -> [u8; 32] {
    let mut out = *bytes;
    out.reverse();
    out
}

fn convert_tx(tx: &bitcoin::Transaction, time: i64) -> Tx {
    let vin = tx
        .input
        .iter()
        .map(|input| Vin {
            prevout: (!input.previous_output.is_null()).then(|| OutPoint {
                txid: txid_bytes(&input.previous_output.txid),
                vout: input.previous_output.vout,
            }),
        })
        .collect();

    let vout = tx
        .output
        .iter()
        .map(|output| Vout {
            value_sat: BigUint::from(output.value.to_sat()),
            script: output.script_pubkey.to_bytes(),
        })
        .collect();

    Tx {
        txid: txid_bytes(&tx.compute_txid()),
        vin,
        vout,
        locktime: tx.lock_time.to_consensus_u32(),
        time,
    }
}
