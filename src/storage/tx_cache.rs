use std::sync::Arc;

use tracing::debug;

use crate::{
    chain::{BlockChain, ChainParser, Tx, Txid},
    error::Error,
    sync::stages::index::{TransactionsKV, records::PackedTxRecord},
};

use super::kv_store::Store;

/// Write-through cache of full transactions in front of the node RPC.
/// Confirmed txs fetched on a miss are stored back into the transactions
/// column; mempool txs are never persisted. Entries may be evicted at any
/// time without affecting correctness elsewhere.
pub struct TxCache {
    store: Arc<Store>,
    chain: Arc<dyn BlockChain>,
    parser: Arc<dyn ChainParser>,
    enabled: bool,
}

impl TxCache {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn BlockChain>,
        parser: Arc<dyn ChainParser>,
        enabled: bool,
    ) -> Self {
        Self {
            store,
            chain,
            parser,
            enabled,
        }
    }

    /// Returns the tx and its height (`None` while unconfirmed). The
    /// caller derives confirmations from the current best height via
    /// [`Self::confirmations`].
    pub fn get(&self, txid: &Txid) -> Result<(Tx, Option<u32>), Error> {
        if let Some(packed) = self.store.get::<TransactionsKV>(txid)? {
            let (tx, height) = self.parser.unpack_tx(&packed.0)?;
            return Ok((tx, Some(height)));
        }

        let (tx, height) = self.chain.get_transaction(txid)?;

        if self.enabled {
            if let Some(height) = height {
                debug!("caching tx {} at height {height}", hex::encode(txid));
                self.put(&tx, height)?;
            }
        }

        Ok((tx, height))
    }

    pub fn confirmations(best_height: u32, height: Option<u32>) -> u32 {
        match height {
            Some(height) if height <= best_height => best_height - height + 1,
            _ => 0,
        }
    }

    pub fn put(&self, tx: &Tx, height: u32) -> Result<(), Error> {
        let packed = PackedTxRecord(self.parser.pack_tx(tx, height));
        let mut batch = self.store.batch();
        batch.put::<TransactionsKV>(&tx.txid, &packed);
        self.store.commit(batch)
    }

    pub fn delete(&self, txid: &Txid) -> Result<(), Error> {
        let mut batch = self.store.batch();
        batch.delete::<TransactionsKV>(txid);
        self.store.commit(batch)
    }
}
