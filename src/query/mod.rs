use std::{collections::HashSet, sync::Arc};

use num_bigint::{BigInt, BigUint, Sign};
use serde::Serialize;
use tracing::{error, warn};

use crate::{
    chain::{AddressDescriptor, BlockChain, ChainParser, Tx, Txid, txid_from_hex},
    error::Error,
    storage::tx_cache::TxCache,
    sync::stages::index::{
        Indexer,
        records::{BlockInfoRecord, TxAddressesRecord},
    },
};

pub mod subs;

/// Builds the user-facing views by joining the index columns, the tx cache
/// and, for mempool data, the live node.
pub struct QueryEngine {
    indexer: Arc<Indexer>,
    chain: Arc<dyn BlockChain>,
    parser: Arc<dyn ChainParser>,
    tx_cache: Arc<TxCache>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressInfo {
    pub address: String,
    pub balance: String,
    pub total_received: String,
    pub total_sent: String,
    pub tx_count: usize,
    pub unconfirmed_balance: String,
    pub unconfirmed_tx_count: usize,
    pub txs: Vec<TxDetail>,
    pub page: usize,
    pub total_pages: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDetail {
    pub txid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u32>,
    pub block_time: i64,
    pub confirmations: u32,
    pub fees: String,
    pub value_in: String,
    pub value_out: String,
    pub vin: Vec<VinDetail>,
    pub vout: Vec<VoutDetail>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VinDetail {
    pub n: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoutDetail {
    pub n: usize,
    pub value: String,
    pub spent: bool,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeaderInfo {
    pub hash: String,
    pub height: u32,
    pub confirmations: u32,
    pub time: i64,
    pub prev_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryIndexes {
    pub input_indexes: Vec<usize>,
    pub output_indexes: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub txid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub confirmations: u32,
    pub addresses: std::collections::BTreeMap<String, HistoryIndexes>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressHistory {
    pub total_count: usize,
    pub items: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MempoolEntryInfo {
    pub vsize: u32,
    pub fee: String,
    pub time: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub coin: String,
    pub blocks: u32,
    pub best_hash: String,
    pub schema_version: u32,
    pub initial_sync: bool,
}

/// Reverses the order of txids (newest first) and removes duplicates,
/// preserving the first occurrence.
pub fn unique_txids_in_reverse(txids: &[Txid]) -> Vec<Txid> {
    let mut seen = HashSet::with_capacity(txids.len());
    let mut unique = Vec::with_capacity(txids.len());

    for txid in txids {
        if seen.insert(*txid) {
            unique.push(*txid);
        }
    }

    unique.reverse();
    unique
}

impl QueryEngine {
    pub fn new(
        indexer: Arc<Indexer>,
        chain: Arc<dyn BlockChain>,
        tx_cache: Arc<TxCache>,
    ) -> Self {
        let parser = indexer.parser().clone();
        Self {
            indexer,
            chain,
            parser,
            tx_cache,
        }
    }

    fn best_height(&self) -> u32 {
        self.indexer.best_block().map(|p| p.height).unwrap_or(0)
    }

    pub fn address_descriptor(&self, address: &str) -> Result<AddressDescriptor, Error> {
        self.parser.address_to_descriptor(address)
    }

    fn confirmed_txids(&self, descriptor: &AddressDescriptor) -> Result<Vec<Txid>, Error> {
        let mut txids = Vec::new();
        self.indexer
            .get_transactions(descriptor, 0, u32::MAX, |txid, _, _| {
                txids.push(txid);
                Ok(())
            })?;
        Ok(txids)
    }

    /// Mempool txids for a descriptor; failures never break an address
    /// query, they degrade it to confirmed-only.
    fn mempool_txids(&self, descriptor: &AddressDescriptor) -> Vec<Txid> {
        match self.chain.get_mempool_transactions(descriptor) {
            Ok(txids) => unique_txids_in_reverse(&txids),
            Err(e) => {
                error!("mempool lookup failed: {e}");
                Vec::new()
            }
        }
    }

    /// Address balance and paged history. Confirmed pages come from the
    /// index alone; the node is only consulted for the mempool set on the
    /// first page.
    pub fn get_address(
        &self,
        address: &str,
        page: usize,
        page_size: usize,
    ) -> Result<AddressInfo, Error> {
        if page_size == 0 {
            return Err(Error::invalid("pageSize must be positive"));
        }

        let descriptor = self.parser.address_to_descriptor(address)?;

        let balance = self
            .indexer
            .get_address_balance(&descriptor)?
            .ok_or_else(|| Error::not_found("address not found"))?;

        let confirmed = unique_txids_in_reverse(&self.confirmed_txids(&descriptor)?);
        if confirmed.len() != balance.tx_count as usize {
            warn!(
                "inconsistency for address {address}: {} txs in addresses column, \
                 {} in addressBalance",
                confirmed.len(),
                balance.tx_count
            );
        }

        let best_height = self.best_height();
        let total = confirmed.len();
        let total_pages = total.div_ceil(page_size);

        // clamp past-the-end requests to the last non-empty page
        let mut page = page;
        if page * page_size >= total {
            page = if total == 0 { 0 } else { (total - 1) / page_size };
        }
        let from = page * page_size;
        let to = (from + page_size).min(total);

        let mut txs = Vec::new();
        let mut unconfirmed_balance = BigInt::ZERO;
        let mut unconfirmed_tx_count = 0;

        if page == 0 {
            let mempool = self.mempool_txids(&descriptor);
            unconfirmed_tx_count = mempool.len();

            for txid in mempool {
                // a mempool tx may vanish between listing and fetch
                match self.transaction_detail(&txid, best_height) {
                    Ok((detail, tx)) => {
                        unconfirmed_balance += self.net_value(&tx, &descriptor)?;
                        txs.push(detail);
                    }
                    Err(e) => error!("mempool tx {}: {e}", hex::encode(txid)),
                }
            }
        }

        for txid in &confirmed[from..to] {
            let Some(ta) = self.indexer.get_tx_addresses(txid)? else {
                warn!("inconsistency: tx {} not found in txAddresses", hex::encode(txid));
                continue;
            };
            let Some(bi) = self.indexer.get_block_info(ta.height)? else {
                warn!("inconsistency: block height {} not found", ta.height);
                continue;
            };
            txs.push(self.tx_from_tx_addresses(txid, &ta, &bi, best_height));
        }

        Ok(AddressInfo {
            address: address.to_string(),
            balance: self.parser.amount_to_decimal(&balance.balance_sat),
            total_received: self.parser.amount_to_decimal(&balance.received_sat()),
            total_sent: self.parser.amount_to_decimal(&balance.sent_sat),
            tx_count: total,
            unconfirmed_balance: self.signed_decimal(&unconfirmed_balance),
            unconfirmed_tx_count,
            txs,
            page,
            total_pages,
            page_size,
        })
    }

    /// Net effect of a tx on one descriptor: outputs to it minus inputs
    /// from it, inputs resolved the same way as the detailed view.
    fn net_value(&self, tx: &Tx, descriptor: &AddressDescriptor) -> Result<BigInt, Error> {
        let mut net = BigInt::ZERO;

        for vout in &tx.vout {
            if &self.parser.script_to_descriptor(&vout.script) == descriptor {
                net += BigInt::from_biguint(Sign::Plus, vout.value_sat.clone());
            }
        }

        for vin in &tx.vin {
            let Some(prevout) = &vin.prevout else { continue };
            if let Some((prev_descriptor, value)) = self.resolve_input(prevout)? {
                if &prev_descriptor == descriptor {
                    net -= BigInt::from_biguint(Sign::Plus, value);
                }
            }
        }

        Ok(net)
    }

    /// Previous-output resolution: the txAddresses column first, falling
    /// back to the tx cache for mempool ancestors.
    fn resolve_input(
        &self,
        prevout: &crate::chain::OutPoint,
    ) -> Result<Option<(AddressDescriptor, BigUint)>, Error> {
        if let Some(record) = self.indexer.get_tx_addresses(&prevout.txid)? {
            if let Some(output) = record.outputs.get(prevout.vout as usize) {
                return Ok(Some((output.descriptor.clone(), output.value_sat.clone())));
            }
        }

        match self.tx_cache.get(&prevout.txid) {
            Ok((prev_tx, _)) => Ok(prev_tx.vout.get(prevout.vout as usize).map(|output| {
                (
                    self.parser.script_to_descriptor(&output.script),
                    output.value_sat.clone(),
                )
            })),
            Err(e) => {
                warn!(
                    "cannot resolve input {}:{}: {e}",
                    hex::encode(prevout.txid),
                    prevout.vout
                );
                Ok(None)
            }
        }
    }

    /// Single-transaction view with spend resolution (fee, input values and
    /// addresses), via the tx cache and the index.
    pub fn get_transaction(&self, txid_hex: &str) -> Result<TxDetail, Error> {
        let txid = txid_from_hex(txid_hex)?;
        let (detail, _) = self.transaction_detail(&txid, self.best_height())?;
        Ok(detail)
    }

    fn transaction_detail(
        &self,
        txid: &Txid,
        best_height: u32,
    ) -> Result<(TxDetail, Tx), Error> {
        let (tx, height) = self.tx_cache.get(txid)?;
        let confirmations = TxCache::confirmations(best_height, height);

        let block_hash = match height {
            Some(height) if confirmations > 0 => self.indexer.get_block_hash(height)?,
            _ => None,
        };

        // own record carries the spent flags of this tx's outputs
        let own_record = self.indexer.get_tx_addresses(txid)?;

        let mut value_in = BigUint::ZERO;
        let mut vin = Vec::with_capacity(tx.vin.len());
        for (n, input) in tx.vin.iter().enumerate() {
            let mut detail = VinDetail {
                n,
                txid: input.prevout.map(|p| hex::encode(p.txid)),
                vout: input.prevout.map(|p| p.vout),
                addr: None,
                value: self.parser.amount_to_decimal(&BigUint::ZERO),
            };

            if let Some(prevout) = &input.prevout {
                if let Some((descriptor, value)) = self.resolve_input(prevout)? {
                    detail.addr = self.render_single_address(&descriptor);
                    detail.value = self.parser.amount_to_decimal(&value);
                    value_in += value;
                }
            }

            vin.push(detail);
        }

        let mut value_out = BigUint::ZERO;
        let mut vout = Vec::with_capacity(tx.vout.len());
        for (n, output) in tx.vout.iter().enumerate() {
            let descriptor = self.parser.script_to_descriptor(&output.script);
            let addresses = match self.parser.descriptor_to_addresses(&descriptor) {
                Ok((addresses, _)) => addresses,
                Err(_) => Vec::new(),
            };

            let spent = own_record
                .as_ref()
                .and_then(|r| r.outputs.get(n))
                .map(|o| o.spent)
                .unwrap_or(false);

            value_out += &output.value_sat;
            vout.push(VoutDetail {
                n,
                value: self.parser.amount_to_decimal(&output.value_sat),
                spent,
                addresses,
            });
        }

        let fees = if value_in > value_out {
            &value_in - &value_out
        } else {
            BigUint::ZERO // floored; coinbase has no inputs
        };

        let detail = TxDetail {
            txid: hex::encode(txid),
            block_hash: block_hash.map(hex::encode),
            block_height: height,
            block_time: tx.time,
            confirmations,
            fees: self.parser.amount_to_decimal(&fees),
            value_in: self.parser.amount_to_decimal(&value_in),
            value_out: self.parser.amount_to_decimal(&value_out),
            vin,
            vout,
        };

        Ok((detail, tx))
    }

    /// Confirmed-history fast path: the view is materialized from the
    /// txAddresses record and block info alone, never from the node.
    fn tx_from_tx_addresses(
        &self,
        txid: &Txid,
        record: &TxAddressesRecord,
        block_info: &BlockInfoRecord,
        best_height: u32,
    ) -> TxDetail {
        let mut value_in = BigUint::ZERO;
        let vin = record
            .inputs
            .iter()
            .enumerate()
            .map(|(n, input)| {
                value_in += &input.value_sat;
                VinDetail {
                    n,
                    txid: None,
                    vout: None,
                    addr: self.render_single_address(&input.descriptor),
                    value: self.parser.amount_to_decimal(&input.value_sat),
                }
            })
            .collect();

        let mut value_out = BigUint::ZERO;
        let vout = record
            .outputs
            .iter()
            .enumerate()
            .map(|(n, output)| {
                value_out += &output.value_sat;
                VoutDetail {
                    n,
                    value: self.parser.amount_to_decimal(&output.value_sat),
                    spent: output.spent,
                    addresses: self
                        .parser
                        .descriptor_to_addresses(&output.descriptor)
                        .map(|(addresses, _)| addresses)
                        .unwrap_or_default(),
                }
            })
            .collect();

        let fees = if value_in > value_out {
            &value_in - &value_out
        } else {
            BigUint::ZERO
        };

        TxDetail {
            txid: hex::encode(txid),
            block_hash: Some(hex::encode(block_info.hash)),
            block_height: Some(record.height),
            block_time: block_info.time,
            confirmations: best_height - record.height + 1,
            fees: self.parser.amount_to_decimal(&fees),
            value_in: self.parser.amount_to_decimal(&value_in),
            value_out: self.parser.amount_to_decimal(&value_out),
            vin,
            vout,
        }
    }

    fn render_single_address(&self, descriptor: &[u8]) -> Option<String> {
        match self.parser.descriptor_to_addresses(descriptor) {
            Ok((addresses, _)) if addresses.len() == 1 => addresses.into_iter().next(),
            _ => None,
        }
    }

    fn signed_decimal(&self, value: &BigInt) -> String {
        let (sign, magnitude) = value.clone().into_parts();
        let rendered = self.parser.amount_to_decimal(&magnitude);
        match sign {
            Sign::Minus => format!("-{rendered}"),
            _ => rendered,
        }
    }

    /// Flat txid list over a set of addresses, newest first. `higher = 0`
    /// means no upper height bound.
    pub fn get_address_txids(
        &self,
        addresses: &[String],
        lower: u32,
        higher: u32,
        mempool_only: bool,
    ) -> Result<Vec<String>, Error> {
        let higher = if higher == 0 { u32::MAX } else { higher };
        let mut txids = Vec::new();

        for address in addresses {
            let descriptor = self.parser.address_to_descriptor(address)?;

            if mempool_only {
                txids.extend(self.mempool_txids(&descriptor));
            } else {
                self.indexer
                    .get_transactions(&descriptor, lower, higher, |txid, _, _| {
                        txids.push(txid);
                        Ok(())
                    })?;
            }
        }

        Ok(unique_txids_in_reverse(&txids)
            .into_iter()
            .map(hex::encode)
            .collect())
    }

    /// Windowed history items over a set of addresses, with per-address
    /// input/output indexes resolved for each tx.
    #[allow(clippy::too_many_arguments)]
    pub fn get_address_history(
        &self,
        addresses: &[String],
        from: usize,
        to: usize,
        lower: u32,
        higher: u32,
        mempool_only: bool,
    ) -> Result<AddressHistory, Error> {
        let txids = self.get_address_txids(addresses, lower, higher, mempool_only)?;
        let best_height = self.best_height();

        let descriptors = addresses
            .iter()
            .map(|address| {
                Ok((
                    self.parser.address_to_descriptor(address)?,
                    address.clone(),
                ))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut items = Vec::new();

        for (i, txid_hex) in txids.iter().enumerate() {
            if i < from || i >= to {
                continue;
            }

            let txid = txid_from_hex(txid_hex)?;
            let (tx, height) = self.tx_cache.get(&txid)?;

            let mut indexes: std::collections::BTreeMap<String, HistoryIndexes> =
                Default::default();

            for (n, vout) in tx.vout.iter().enumerate() {
                let descriptor = self.parser.script_to_descriptor(&vout.script);
                for (wanted, address) in &descriptors {
                    if wanted == &descriptor {
                        indexes
                            .entry(address.clone())
                            .or_insert_with(|| HistoryIndexes {
                                input_indexes: vec![],
                                output_indexes: vec![],
                            })
                            .output_indexes
                            .push(n);
                    }
                }
            }

            for (n, vin) in tx.vin.iter().enumerate() {
                let Some(prevout) = &vin.prevout else { continue };
                let Some((descriptor, _)) = self.resolve_input(prevout)? else {
                    continue;
                };
                for (wanted, address) in &descriptors {
                    if wanted == &descriptor {
                        indexes
                            .entry(address.clone())
                            .or_insert_with(|| HistoryIndexes {
                                input_indexes: vec![],
                                output_indexes: vec![],
                            })
                            .input_indexes
                            .push(n);
                    }
                }
            }

            items.push(HistoryItem {
                txid: txid_hex.clone(),
                height,
                confirmations: TxCache::confirmations(best_height, height),
                addresses: indexes,
            });
        }

        Ok(AddressHistory {
            total_count: txids.len(),
            items,
        })
    }

    /// Block header by decimal height or hex hash.
    pub fn get_block_header(&self, height_or_hash: &str) -> Result<BlockHeaderInfo, Error> {
        let hash = if let Ok(height) = height_or_hash.parse::<u32>() {
            self.indexer
                .get_block_hash(height)?
                .ok_or_else(|| Error::not_found(format!("block {height} not found")))?
        } else {
            let bytes =
                hex::decode(height_or_hash).map_err(|_| Error::invalid("invalid block hash"))?;
            bytes
                .try_into()
                .map_err(|_| Error::invalid("block hash must be 32 bytes"))?
        };

        let header = self.chain.get_block_header(&hash)?;
        let best_height = self.best_height();

        Ok(BlockHeaderInfo {
            hash: hex::encode(header.hash),
            height: header.height,
            confirmations: TxCache::confirmations(best_height, Some(header.height)),
            time: header.time,
            prev_hash: hex::encode(header.prev_hash),
        })
    }

    pub fn send_transaction(&self, raw_hex: &str) -> Result<String, Error> {
        if raw_hex.is_empty() || hex::decode(raw_hex).is_err() {
            return Err(Error::invalid("invalid raw transaction hex"));
        }

        let txid = self.chain.send_raw_transaction(raw_hex)?;
        Ok(hex::encode(txid))
    }

    pub fn get_mempool_entry(&self, txid_hex: &str) -> Result<MempoolEntryInfo, Error> {
        let txid = txid_from_hex(txid_hex)?;
        let entry = self.chain.get_mempool_entry(&txid)?;

        Ok(MempoolEntryInfo {
            vsize: entry.vsize,
            fee: self.parser.amount_to_decimal(&entry.fee_sat),
            time: entry.time,
        })
    }

    pub fn estimate_fee(&self, blocks: u16) -> Result<String, Error> {
        Ok(self.parser.amount_to_decimal(&self.chain.estimate_fee(blocks)?))
    }

    pub fn estimate_smart_fee(&self, blocks: u16, conservative: bool) -> Result<String, Error> {
        Ok(self
            .parser
            .amount_to_decimal(&self.chain.estimate_smart_fee(blocks, conservative)?))
    }

    pub fn get_info(&self) -> IndexInfo {
        let state = self.indexer.internal_state();
        let (blocks, best_hash) = match state.best {
            Some(point) => (point.height, hex::encode(point.hash)),
            None => (0, String::new()),
        };

        IndexInfo {
            coin: state.coin,
            blocks,
            best_hash,
            schema_version: state.schema_version,
            initial_sync: state.initial_sync,
        }
    }
}
