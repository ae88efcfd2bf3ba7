use num_bigint::BigUint;
use tokio::sync::broadcast;

use crate::{
    error::Error,
    storage::encdec::{
        Decode, DecodingResult, malformed_input, read_bigint, read_varuint, write_bigint,
        write_varuint,
    },
};

pub mod bitcoin;
pub mod rpc;

/// Transaction id as stored and displayed: 32 bytes whose hex is the
/// conventional (big-endian) txid string.
pub type Txid = [u8; 32];

pub type BlockHash = [u8; 32];

/// Canonical byte representation of a recipient, derived from an output
/// script by the chain parser. Equal descriptors denote the same economic
/// recipient.
pub type AddressDescriptor = Vec<u8>;

/// Descriptors longer than this are never indexed.
pub const MAX_DESCRIPTOR_LEN: usize = 1024;

pub fn txid_from_hex(hex_str: &str) -> Result<Txid, Error> {
    let bytes = hex::decode(hex_str).map_err(|_| Error::invalid("invalid txid hex"))?;
    bytes
        .try_into()
        .map_err(|_| Error::invalid("txid must be 32 bytes"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vin {
    /// `None` for coinbase inputs.
    pub prevout: Option<OutPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vout {
    pub value_sat: BigUint,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub txid: Txid,
    pub vin: Vec<Vin>,
    pub vout: Vec<Vout>,
    pub locktime: u32,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u32,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub time: i64,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Tx>,
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub vsize: u32,
    pub fee_sat: BigUint,
    pub time: i64,
}

/// Events pushed by the backing node.
#[derive(Debug, Clone)]
pub enum NodeNotification {
    NewBlock { height: u32, hash: BlockHash },
    NewTx(Txid),
}

/// Per-coin script and address handling, selected at construction time.
pub trait ChainParser: Send + Sync {
    fn coin_name(&self) -> &str;

    /// Decodes an address string into its output script.
    fn address_to_script(&self, address: &str) -> Result<Vec<u8>, Error>;

    /// Canonicalizes an output script into an address descriptor. Distinct
    /// scripts the coin considers equivalent (e.g. P2PK and P2PKH for the
    /// same key) collapse to one descriptor.
    fn script_to_descriptor(&self, script: &[u8]) -> AddressDescriptor;

    /// Renders a descriptor back into address strings plus a flag telling
    /// whether the descriptor is searchable (renders to a canonical address).
    fn descriptor_to_addresses(&self, descriptor: &[u8]) -> Result<(Vec<String>, bool), Error>;

    /// Exact decimal rendering of a base-unit amount.
    fn amount_to_decimal(&self, sat: &BigUint) -> String;

    /// Compact encoding of a transaction plus its height for the tx cache.
    fn pack_tx(&self, tx: &Tx, height: u32) -> Vec<u8> {
        pack_tx_default(tx, height)
    }

    fn unpack_tx(&self, bytes: &[u8]) -> Result<(Tx, u32), Error> {
        unpack_tx_default(bytes)
    }

    /// Whether the chain supports block disconnects (UTXO model).
    fn supports_disconnect(&self) -> bool {
        true
    }

    fn address_to_descriptor(&self, address: &str) -> Result<AddressDescriptor, Error> {
        Ok(self.script_to_descriptor(&self.address_to_script(address)?))
    }
}

/// Access to the backing blockchain node.
pub trait BlockChain: Send + Sync {
    fn best_block(&self) -> Result<(u32, BlockHash), Error>;

    fn get_block_hash(&self, height: u32) -> Result<BlockHash, Error>;

    fn get_block(&self, height: u32, hash: Option<&BlockHash>) -> Result<Block, Error>;

    fn get_block_header(&self, hash: &BlockHash) -> Result<BlockHeader, Error>;

    /// Returns the transaction and its block height, `None` for mempool txs.
    fn get_transaction(&self, txid: &Txid) -> Result<(Tx, Option<u32>), Error>;

    /// Mempool txids touching the given descriptor, as outputs or inputs.
    fn get_mempool_transactions(&self, descriptor: &[u8]) -> Result<Vec<Txid>, Error>;

    fn get_mempool_entry(&self, txid: &Txid) -> Result<MempoolEntry, Error>;

    fn send_raw_transaction(&self, hex: &str) -> Result<Txid, Error>;

    /// Fee per kB to confirm within `blocks` blocks, in base units.
    fn estimate_fee(&self, blocks: u16) -> Result<BigUint, Error>;

    fn estimate_smart_fee(&self, blocks: u16, conservative: bool) -> Result<BigUint, Error>;

    /// New-block / new-tx push notifications.
    fn notifications(&self) -> broadcast::Receiver<NodeNotification>;
}

/// Default tx packing used by the transactions column: height, time,
/// locktime, then inputs (outpoints) and outputs (value + script).
pub fn pack_tx_default(tx: &Tx, height: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + tx.vout.len() * 40);
    out.extend_from_slice(&tx.txid);
    write_varuint(height as u64, &mut out);
    write_varuint(tx.time as u64, &mut out);
    write_varuint(tx.locktime as u64, &mut out);

    write_varuint(tx.vin.len() as u64, &mut out);
    for vin in &tx.vin {
        match &vin.prevout {
            Some(prevout) => {
                out.push(1);
                out.extend_from_slice(&prevout.txid);
                write_varuint(prevout.vout as u64, &mut out);
            }
            None => out.push(0),
        }
    }

    write_varuint(tx.vout.len() as u64, &mut out);
    for vout in &tx.vout {
        write_bigint(&vout.value_sat, &mut out);
        write_varuint(vout.script.len() as u64, &mut out);
        out.extend_from_slice(&vout.script);
    }

    out
}

pub fn unpack_tx_default(bytes: &[u8]) -> Result<(Tx, u32), Error> {
    fn inner(bytes: &[u8]) -> DecodingResult<'_, (Tx, u32)> {
        let (txid, bytes) = <[u8; 32]>::decode(bytes)?;
        let (height, bytes) = read_varuint(bytes)?;
        let (time, bytes) = read_varuint(bytes)?;
        let (locktime, bytes) = read_varuint(bytes)?;

        let (n_vin, mut bytes) = read_varuint(bytes)?;
        let mut vin = Vec::with_capacity(n_vin as usize);
        for _ in 0..n_vin {
            let (tag, rest) = u8::decode(bytes)?;
            match tag {
                0 => {
                    vin.push(Vin { prevout: None });
                    bytes = rest;
                }
                1 => {
                    let (txid, rest) = <[u8; 32]>::decode(rest)?;
                    let (vout, rest) = read_varuint(rest)?;
                    vin.push(Vin {
                        prevout: Some(OutPoint {
                            txid,
                            vout: vout as u32,
                        }),
                    });
                    bytes = rest;
                }
                _ => return Err(malformed_input("invalid outpoint tag")),
            }
        }

        let (n_vout, mut bytes) = read_varuint(bytes)?;
        let mut vout = Vec::with_capacity(n_vout as usize);
        for _ in 0..n_vout {
            let (value_sat, rest) = read_bigint(bytes)?;
            let (script_len, rest) = read_varuint(rest)?;
            let (script, rest) = rest
                .split_at_checked(script_len as usize)
                .ok_or(malformed_input("script insufficient bytes"))?;
            vout.push(Vout {
                value_sat,
                script: script.to_vec(),
            });
            bytes = rest;
        }

        let tx = Tx {
            txid,
            vin,
            vout,
            locktime: locktime as u32,
            time: time as i64,
        };

        Ok(((tx, height as u32), bytes))
    }

    Ok(inner(bytes)
        .map_err(|e| Error::corrupt(crate::storage::kv_store::COLUMN_TRANSACTIONS, &[], e))?
        .0)
}
