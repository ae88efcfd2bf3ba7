use std::{
    collections::HashMap,
    sync::{Arc, Mutex, atomic::AtomicBool},
};

use num_bigint::BigUint;
use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::{
    chain::{
        AddressDescriptor, Block, BlockChain, BlockHash, BlockHeader, ChainParser, MempoolEntry,
        NodeNotification, OutPoint, Tx, Txid, Vin, Vout, bitcoin::BitcoinParser, txid_from_hex,
    },
    error::Error,
    storage::{
        kv_store::{COLUMN_ADDRESSES, COLUMN_TRANSACTIONS, Store},
        tx_cache::TxCache,
    },
};

use super::*;

pub const TXID_B1T1: &str = "00b2c06055e5e90e9c82bd4181fde310104391a7fa4f289b1704e5d90caa3840";
pub const TXID_B1T2: &str = "effd9ef509383d536b1c8af5bf434c8efbf521a4f2befd4022bbd68694b4ac75";
pub const TXID_B2T1: &str = "7c3be24063f268aaa1ed81b64776798f56088757641a34fb156c4f51ed2e9d25";
pub const TXID_B2T2: &str = "3d90d15ed026dc45e19ffb52875ed18fa9e8012ad123d7f7212176e2b0ebdb71";
pub const TXID_B2T3: &str = "05e2e48aeabdd9b75def7b48d756ba304713c2aba7b522bf9dbc893fc4231b07";

pub const BLOCK1_HASH: &str = "0000000076fbbed90fd75b0e18856aa35baa984e9c9d444cf746ad85e94e2997";
pub const BLOCK2_HASH: &str = "00000000eb0443fd7dc4a1ed5c686a8e995057805f9a161d9a5a77a95e72b7b6";

pub const ADDR1: &str = "mfcWp7DB6NuaZsExybTTXpVgWz559Np4Ti";
pub const ADDR2: &str = "mtGXQvBowMkBpnhLckhxhbwYK44Gs9eEtz";
pub const ADDR3: &str = "mv9uLThosiEnGRbVPS7Vhyw6VssbVRsiAw";
pub const ADDR4: &str = "2Mz1CYoppGGsLNUGF2YDhTif6J661JitALS";
pub const ADDR5: &str = "2NEVv9LJmAnY99W1pFoc5UJjVdypBqdnvu1";
pub const ADDR6: &str = "mzB8cYrfRwFRFAGTDzV8LkUQy5BQicxGhX";
pub const ADDR7: &str = "mtR97eM2HPWVM6c8FGLGcukgaHHQv7THoL";
pub const ADDR8: &str = "mwwoKQE5Lb1G4picHSHDQKg8jw424PF9SC";
pub const ADDR9: &str = "mmJx9Y8ayz9h14yd9fgCW1bUKoEpkBAquP";

pub const SAT_B1T1_A1: u64 = 100_000_000;
pub const SAT_B1T1_A2: u64 = 12_345;
pub const SAT_B1T2_A3: u64 = 1_234_567_890_123;
pub const SAT_B1T2_A4: u64 = 1;
pub const SAT_B1T2_A5: u64 = 9_876;
pub const SAT_B2T1_A6: u64 = 317_283_951_061;
pub const SAT_B2T1_A7: u64 = 917_283_951_061;
pub const SAT_B2T2_A8: u64 = 118_641_975_500;
pub const SAT_B2T2_A9: u64 = 198_641_975_500;
pub const SAT_B2T3_A5: u64 = 9_000;

pub fn txid(hex_str: &str) -> Txid {
    txid_from_hex(hex_str).unwrap()
}

pub fn block_hash(hex_str: &str) -> BlockHash {
    txid_from_hex(hex_str).unwrap()
}

pub fn testnet_parser() -> Arc<dyn ChainParser> {
    Arc::new(BitcoinParser::new("bitcoin-testnet").unwrap())
}

pub fn descriptor_of(parser: &Arc<dyn ChainParser>, address: &str) -> AddressDescriptor {
    parser.address_to_descriptor(address).unwrap()
}

fn output(parser: &Arc<dyn ChainParser>, address: &str, value: u64) -> Vout {
    Vout {
        value_sat: BigUint::from(value),
        script: parser.address_to_script(address).unwrap(),
    }
}

fn spending(prev_txid: &str, vout: u32) -> Vin {
    Vin {
        prevout: Some(OutPoint {
            txid: txid(prev_txid),
            vout,
        }),
    }
}

pub fn test_block1(parser: &Arc<dyn ChainParser>) -> Block {
    Block {
        header: BlockHeader {
            height: 225_493,
            hash: block_hash(BLOCK1_HASH),
            prev_hash: [0u8; 32],
            time: 22_549_300_000,
            size: 1_234_567,
        },
        txs: vec![
            Tx {
                txid: txid(TXID_B1T1),
                vin: vec![],
                vout: vec![
                    output(parser, ADDR1, SAT_B1T1_A1),
                    output(parser, ADDR2, SAT_B1T1_A2),
                ],
                locktime: 0,
                time: 22_549_300_000,
            },
            Tx {
                txid: txid(TXID_B1T2),
                vin: vec![],
                vout: vec![
                    output(parser, ADDR3, SAT_B1T2_A3),
                    output(parser, ADDR4, SAT_B1T2_A4),
                    output(parser, ADDR5, SAT_B1T2_A5),
                ],
                locktime: 0,
                time: 22_549_300_001,
            },
        ],
    }
}

pub fn test_block2(parser: &Arc<dyn ChainParser>) -> Block {
    Block {
        header: BlockHeader {
            height: 225_494,
            hash: block_hash(BLOCK2_HASH),
            prev_hash: block_hash(BLOCK1_HASH),
            time: 22_549_400_000,
            size: 2_345_678,
        },
        txs: vec![
            Tx {
                txid: txid(TXID_B2T1),
                vin: vec![spending(TXID_B1T2, 0), spending(TXID_B1T1, 1)],
                vout: vec![
                    output(parser, ADDR6, SAT_B2T1_A6),
                    output(parser, ADDR7, SAT_B2T1_A7),
                ],
                locktime: 0,
                time: 22_549_400_000,
            },
            Tx {
                txid: txid(TXID_B2T2),
                // spends an output of the same block and one of block 1
                vin: vec![spending(TXID_B2T1, 0), spending(TXID_B1T2, 1)],
                vout: vec![
                    output(parser, ADDR8, SAT_B2T2_A8),
                    output(parser, ADDR9, SAT_B2T2_A9),
                ],
                locktime: 0,
                time: 22_549_400_001,
            },
            Tx {
                txid: txid(TXID_B2T3),
                vin: vec![spending(TXID_B1T2, 2)],
                vout: vec![output(parser, ADDR5, SAT_B2T3_A5)],
                locktime: 0,
                time: 22_549_400_002,
            },
        ],
    }
}

pub fn setup_index(block_addresses_to_keep: u32) -> (TempDir, Arc<Store>, Arc<Indexer>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(dir.path().to_path_buf(), 64 << 20).unwrap());
    let indexer = Arc::new(
        Indexer::new(store.clone(), testnet_parser(), block_addresses_to_keep).unwrap(),
    );
    (dir, store, indexer)
}

/// In-memory `BlockChain` used by index and query tests.
pub struct FakeChain {
    pub blocks: Mutex<Vec<Block>>,
    pub txs: Mutex<HashMap<Txid, (Tx, Option<u32>)>>,
    pub mempool: Mutex<HashMap<AddressDescriptor, Vec<Txid>>>,
    notify: broadcast::Sender<NodeNotification>,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        let (notify, _) = broadcast::channel(16);
        Arc::new(Self {
            blocks: Default::default(),
            txs: Default::default(),
            mempool: Default::default(),
            notify,
        })
    }

    pub fn add_block(&self, block: Block) {
        let height = block.header.height;
        for tx in &block.txs {
            self.txs
                .lock()
                .unwrap()
                .insert(tx.txid, (tx.clone(), Some(height)));
        }
        self.blocks.lock().unwrap().push(block);
    }

    pub fn add_mempool_tx(&self, tx: Tx, descriptors: Vec<AddressDescriptor>) {
        for descriptor in descriptors {
            self.mempool
                .lock()
                .unwrap()
                .entry(descriptor)
                .or_default()
                .push(tx.txid);
        }
        self.txs.lock().unwrap().insert(tx.txid, (tx, None));
    }
}

impl BlockChain for FakeChain {
    fn best_block(&self) -> Result<(u32, BlockHash), Error> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .iter()
            .max_by_key(|b| b.header.height)
            .map(|b| (b.header.height, b.header.hash))
            .ok_or_else(|| Error::backend("no blocks"))
    }

    fn get_block_hash(&self, height: u32) -> Result<BlockHash, Error> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .iter()
            .find(|b| b.header.height == height)
            .map(|b| b.header.hash)
            .ok_or_else(|| Error::backend(format!("no block at {height}")))
    }

    fn get_block(&self, height: u32, _hash: Option<&BlockHash>) -> Result<Block, Error> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .iter()
            .find(|b| b.header.height == height)
            .cloned()
            .ok_or_else(|| Error::backend(format!("no block at {height}")))
    }

    fn get_block_header(&self, hash: &BlockHash) -> Result<BlockHeader, Error> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .iter()
            .find(|b| &b.header.hash == hash)
            .map(|b| b.header.clone())
            .ok_or_else(|| Error::backend("no such block"))
    }

    fn get_transaction(&self, txid: &Txid) -> Result<(Tx, Option<u32>), Error> {
        self.txs
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::backend(format!("tx {} not found", hex::encode(txid))))
    }

    fn get_mempool_transactions(&self, descriptor: &[u8]) -> Result<Vec<Txid>, Error> {
        Ok(self
            .mempool
            .lock()
            .unwrap()
            .get(descriptor)
            .cloned()
            .unwrap_or_default())
    }

    fn get_mempool_entry(&self, _txid: &Txid) -> Result<MempoolEntry, Error> {
        Err(Error::backend("not a mempool tx"))
    }

    fn send_raw_transaction(&self, _hex: &str) -> Result<Txid, Error> {
        Ok([0xfe; 32])
    }

    fn estimate_fee(&self, _blocks: u16) -> Result<BigUint, Error> {
        Ok(BigUint::from(1_000u32))
    }

    fn estimate_smart_fee(&self, _blocks: u16, _conservative: bool) -> Result<BigUint, Error> {
        Ok(BigUint::from(2_000u32))
    }

    fn notifications(&self) -> broadcast::Receiver<NodeNotification> {
        self.notify.subscribe()
    }
}

/// Compares the full contents of one column against expected (key, value)
/// hex pairs, like the original column-by-column verification.
fn check_column(store: &Store, column: &'static str, mut expected: Vec<(String, String)>) {
    expected.sort();

    let got: Vec<(String, String)> = store
        .dump()
        .unwrap()
        .into_iter()
        .filter(|(c, _, _)| *c == column)
        .map(|(_, k, v)| (hex::encode(k), hex::encode(v)))
        .collect();

    assert_eq!(got, expected, "unexpected contents of column {column}");
}

fn addr_hex(parser: &Arc<dyn ChainParser>, address: &str) -> String {
    hex::encode(descriptor_of(parser, address))
}

fn balance(tx_count: u32, sent: u64, balance: u64) -> records::AddressBalanceRecord {
    records::AddressBalanceRecord {
        tx_count,
        sent_sat: BigUint::from(sent),
        balance_sat: BigUint::from(balance),
    }
}

fn verify_after_block1(store: &Store, indexer: &Indexer, parser: &Arc<dyn ChainParser>) {
    // height 225493 = 0x000370d5
    check_column(
        store,
        COLUMN_ADDRESSES,
        vec![
            (
                addr_hex(parser, ADDR1) + "000370d5",
                TXID_B1T1.to_string() + "00",
            ),
            (
                addr_hex(parser, ADDR2) + "000370d5",
                TXID_B1T1.to_string() + "02",
            ),
            (
                addr_hex(parser, ADDR3) + "000370d5",
                TXID_B1T2.to_string() + "00",
            ),
            (
                addr_hex(parser, ADDR4) + "000370d5",
                TXID_B1T2.to_string() + "02",
            ),
            (
                addr_hex(parser, ADDR5) + "000370d5",
                TXID_B1T2.to_string() + "04",
            ),
        ],
    );

    for (address, expected) in [
        (ADDR1, balance(1, 0, SAT_B1T1_A1)),
        (ADDR2, balance(1, 0, SAT_B1T1_A2)),
        (ADDR3, balance(1, 0, SAT_B1T2_A3)),
        (ADDR4, balance(1, 0, SAT_B1T2_A4)),
        (ADDR5, balance(1, 0, SAT_B1T2_A5)),
    ] {
        assert_eq!(
            indexer
                .get_address_balance(&descriptor_of(parser, address))
                .unwrap(),
            Some(expected),
            "balance of {address} after block 1"
        );
    }

    let info = indexer.get_block_info(225_493).unwrap().unwrap();
    assert_eq!(info.hash, block_hash(BLOCK1_HASH));
    assert_eq!(info.tx_count, 2);

    let b1t1 = indexer.get_tx_addresses(&txid(TXID_B1T1)).unwrap().unwrap();
    assert_eq!(b1t1.height, 225_493);
    assert!(b1t1.inputs.is_empty());
    assert_eq!(b1t1.outputs.len(), 2);
    assert!(!b1t1.outputs[0].spent && !b1t1.outputs[1].spent);

    assert_eq!(
        store
            .get::<BlockTxidsKV>(&225_493)
            .unwrap()
            .unwrap()
            .0,
        vec![txid(TXID_B1T1), txid(TXID_B1T2)]
    );
}

fn verify_after_block2(store: &Store, indexer: &Indexer, parser: &Arc<dyn ChainParser>) {
    check_column(
        store,
        COLUMN_ADDRESSES,
        vec![
            (
                addr_hex(parser, ADDR1) + "000370d5",
                TXID_B1T1.to_string() + "00",
            ),
            (
                addr_hex(parser, ADDR2) + "000370d5",
                TXID_B1T1.to_string() + "02",
            ),
            (
                addr_hex(parser, ADDR3) + "000370d5",
                TXID_B1T2.to_string() + "00",
            ),
            (
                addr_hex(parser, ADDR4) + "000370d5",
                TXID_B1T2.to_string() + "02",
            ),
            (
                addr_hex(parser, ADDR5) + "000370d5",
                TXID_B1T2.to_string() + "04",
            ),
            // outputs are appended before the inputs of the block
            (
                addr_hex(parser, ADDR6) + "000370d6",
                TXID_B2T1.to_string() + "00" + TXID_B2T2 + "01",
            ),
            (
                addr_hex(parser, ADDR7) + "000370d6",
                TXID_B2T1.to_string() + "02",
            ),
            (
                addr_hex(parser, ADDR8) + "000370d6",
                TXID_B2T2.to_string() + "00",
            ),
            (
                addr_hex(parser, ADDR9) + "000370d6",
                TXID_B2T2.to_string() + "02",
            ),
            (
                addr_hex(parser, ADDR3) + "000370d6",
                TXID_B2T1.to_string() + "01",
            ),
            (
                addr_hex(parser, ADDR2) + "000370d6",
                TXID_B2T1.to_string() + "03",
            ),
            (
                addr_hex(parser, ADDR5) + "000370d6",
                TXID_B2T3.to_string() + "00" + TXID_B2T3 + "01",
            ),
            (
                addr_hex(parser, ADDR4) + "000370d6",
                TXID_B2T2.to_string() + "03",
            ),
        ],
    );

    for (address, expected) in [
        (ADDR1, balance(1, 0, SAT_B1T1_A1)),
        (ADDR2, balance(2, SAT_B1T1_A2, 0)),
        (ADDR3, balance(2, SAT_B1T2_A3, 0)),
        (ADDR4, balance(2, SAT_B1T2_A4, 0)),
        (ADDR5, balance(2, SAT_B1T2_A5, SAT_B2T3_A5)),
        (ADDR6, balance(2, SAT_B2T1_A6, 0)),
        (ADDR7, balance(1, 0, SAT_B2T1_A7)),
        (ADDR8, balance(1, 0, SAT_B2T2_A8)),
        (ADDR9, balance(1, 0, SAT_B2T2_A9)),
    ] {
        assert_eq!(
            indexer
                .get_address_balance(&descriptor_of(parser, address))
                .unwrap(),
            Some(expected),
            "balance of {address} after block 2"
        );
    }

    // spent flags: B1T1 vout 1 and all of B1T2 are consumed, B2T1 vout 0
    // is consumed within its own block
    let b1t1 = indexer.get_tx_addresses(&txid(TXID_B1T1)).unwrap().unwrap();
    assert!(!b1t1.outputs[0].spent);
    assert!(b1t1.outputs[1].spent);

    let b1t2 = indexer.get_tx_addresses(&txid(TXID_B1T2)).unwrap().unwrap();
    assert!(b1t2.outputs.iter().all(|o| o.spent));

    let b2t1 = indexer.get_tx_addresses(&txid(TXID_B2T1)).unwrap().unwrap();
    assert_eq!(b2t1.height, 225_494);
    assert_eq!(
        b2t1.inputs
            .iter()
            .map(|i| (i.descriptor.clone(), i.value_sat.clone()))
            .collect::<Vec<_>>(),
        vec![
            (
                descriptor_of(parser, ADDR3),
                BigUint::from(SAT_B1T2_A3)
            ),
            (
                descriptor_of(parser, ADDR2),
                BigUint::from(SAT_B1T1_A2)
            ),
        ]
    );
    assert!(b2t1.outputs[0].spent);
    assert!(!b2t1.outputs[1].spent);

    let b2t3 = indexer.get_tx_addresses(&txid(TXID_B2T3)).unwrap().unwrap();
    assert_eq!(b2t3.inputs[0].value_sat, BigUint::from(SAT_B1T2_A5));
    assert_eq!(b2t3.outputs[0].value_sat, BigUint::from(SAT_B2T3_A5));

    assert_eq!(
        store
            .get::<BlockTxidsKV>(&225_494)
            .unwrap()
            .unwrap()
            .0,
        vec![txid(TXID_B2T1), txid(TXID_B2T2), txid(TXID_B2T3)]
    );
}

fn collect_transactions(
    indexer: &Indexer,
    parser: &Arc<dyn ChainParser>,
    address: &str,
    lower: u32,
    higher: u32,
) -> Vec<(Txid, u32, bool)> {
    let mut got = Vec::new();
    indexer
        .get_transactions(
            &descriptor_of(parser, address),
            lower,
            higher,
            |txid, io, is_output| {
                got.push((txid, io, is_output));
                Ok(())
            },
        )
        .unwrap();
    got
}

#[test]
fn connect_disconnect_utxo_blocks() {
    let parser = testnet_parser();
    let (_dir, store, indexer) = setup_index(300);

    // connect the 1st block
    let block1 = test_block1(&parser);
    let result = indexer.connect_block(&block1).unwrap();
    assert_eq!(result.point.height, 225_493);
    verify_after_block1(&store, &indexer, &parser);

    let snapshot_after_block1 = store.dump().unwrap();

    // connect the 2nd block, spending outputs of the 1st and one of its own
    let block2 = test_block2(&parser);
    let result = indexer.connect_block(&block2).unwrap();
    assert_eq!(
        result
            .address_events
            .iter()
            .filter(|e| e.is_input)
            .count(),
        5
    );
    verify_after_block2(&store, &indexer, &parser);

    // per-address iteration across ranges
    assert_eq!(
        collect_transactions(&indexer, &parser, ADDR2, 0, 1_000_000),
        vec![
            (txid(TXID_B1T1), 1, true),
            (txid(TXID_B2T1), 1, false),
        ]
    );
    assert_eq!(
        collect_transactions(&indexer, &parser, ADDR2, 225_493, 225_493),
        vec![(txid(TXID_B1T1), 1, true)]
    );
    assert_eq!(
        collect_transactions(&indexer, &parser, ADDR2, 225_494, 1_000_000),
        vec![(txid(TXID_B2T1), 1, false)]
    );
    assert!(collect_transactions(&indexer, &parser, ADDR2, 500_000, 1_000_000).is_empty());
    assert_eq!(
        collect_transactions(&indexer, &parser, ADDR8, 0, 1_000_000),
        vec![(txid(TXID_B2T2), 0, true)]
    );

    // best block and block hash lookups
    let best = indexer.best_block().unwrap();
    assert_eq!(best.height, 225_494);
    assert_eq!(best.hash, block_hash(BLOCK2_HASH));
    assert_eq!(
        indexer.get_block_hash(225_493).unwrap(),
        Some(block_hash(BLOCK1_HASH))
    );

    // tx caching: put, read back, delete; leave one entry to check that
    // disconnect cleans it up
    let chain = FakeChain::new();
    let tx_cache = TxCache::new(store.clone(), chain.clone(), parser.clone(), true);
    let cached_tx = &block2.txs[1];
    tx_cache.put(cached_tx, 225_494).unwrap();
    let (got, height) = tx_cache.get(&cached_tx.txid).unwrap();
    assert_eq!(got, *cached_tx);
    assert_eq!(height, Some(225_494));
    tx_cache.delete(&cached_tx.txid).unwrap();

    tx_cache.put(cached_tx, 225_494).unwrap();
    check_column(
        &store,
        COLUMN_TRANSACTIONS,
        vec![(
            TXID_B2T2.to_string(),
            hex::encode(parser.pack_tx(cached_tx, 225_494)),
        )],
    );

    // single-block disconnect is refused on UTXO chains
    let err = indexer.disconnect_block(&block2).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation(_)));
    verify_after_block2(&store, &indexer, &parser);

    // disconnect the 2nd block; the store must return to the exact
    // post-block-1 state, spent flags and cached tx included
    indexer.disconnect_block_range(225_494, 225_494).unwrap();
    verify_after_block1(&store, &indexer, &parser);
    assert_eq!(store.dump().unwrap(), snapshot_after_block1);
}

/// Recomputes every balance from the txAddresses rows and compares it to
/// the addressBalance column.
fn verify_balance_invariant(store: &Store) {
    let mut computed: HashMap<Vec<u8>, (BigUint, BigUint)> = HashMap::new();

    for item in store.iterate_all::<TxAddressesKV>() {
        let (_, record) = item.unwrap();
        for io in &record.outputs {
            if io.descriptor.is_empty() {
                continue;
            }
            computed.entry(io.descriptor.clone()).or_default().0 += &io.value_sat;
        }
        for io in &record.inputs {
            if io.descriptor.is_empty() {
                continue;
            }
            computed.entry(io.descriptor.clone()).or_default().1 += &io.value_sat;
        }
    }

    for item in store.iterate_all::<AddressBalanceKV>() {
        let (descriptor, record) = item.unwrap();
        let (received, sent) = computed
            .remove(&descriptor)
            .unwrap_or_else(|| panic!("balance row for unknown {}", hex::encode(&descriptor)));

        assert_eq!(record.sent_sat, sent, "sent of {}", hex::encode(&descriptor));
        assert_eq!(
            record.balance_sat,
            received - sent,
            "balance of {}",
            hex::encode(&descriptor)
        );
    }

    assert!(
        computed.is_empty(),
        "txAddresses reference addresses without balance rows"
    );
}

#[test]
fn balances_equal_tx_addresses_sums() {
    let parser = testnet_parser();
    let (_dir, store, indexer) = setup_index(300);

    indexer.connect_block(&test_block1(&parser)).unwrap();
    verify_balance_invariant(&store);

    indexer.connect_block(&test_block2(&parser)).unwrap();
    verify_balance_invariant(&store);

    indexer.disconnect_block_range(225_494, 225_494).unwrap();
    verify_balance_invariant(&store);
}

#[test]
fn connect_refuses_stale_heights() {
    let parser = testnet_parser();
    let (_dir, _store, indexer) = setup_index(300);

    indexer.connect_block(&test_block1(&parser)).unwrap();
    indexer.connect_block(&test_block2(&parser)).unwrap();

    let err = indexer.connect_block(&test_block2(&parser)).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn fast_disconnect_requires_undo_records() {
    let parser = testnet_parser();
    // retention of a single block ages out the first undo record
    let (_dir, store, indexer) = setup_index(1);

    indexer.connect_block(&test_block1(&parser)).unwrap();
    indexer.connect_block(&test_block2(&parser)).unwrap();

    assert!(store.get::<BlockAddressesKV>(&225_493).unwrap().is_none());
    assert!(store.get::<BlockAddressesKV>(&225_494).unwrap().is_some());

    let err = indexer.disconnect_block_range(225_493, 225_494).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation(_)));
}

#[test]
fn full_scan_disconnect_empties_the_index() {
    let parser = testnet_parser();
    let (_dir, store, indexer) = setup_index(1);

    let chain = FakeChain::new();
    chain.add_block(test_block1(&parser));
    chain.add_block(test_block2(&parser));

    indexer.connect_block(&test_block1(&parser)).unwrap();
    indexer.connect_block(&test_block2(&parser)).unwrap();

    let tx_cache = TxCache::new(store.clone(), chain, parser.clone(), true);
    indexer
        .disconnect_block_range_full_scan(225_493, 225_494, &tx_cache)
        .unwrap();

    assert!(indexer.best_block().is_none());

    // nothing but the internal state sentinel survives
    let rows = store.dump().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, crate::storage::kv_store::COLUMN_DEFAULT);
}

#[test]
fn parallel_connect_equals_sequential() {
    let parser = testnet_parser();

    let (_dir_a, store_a, indexer_a) = setup_index(300);
    indexer_a.connect_block(&test_block1(&parser)).unwrap();
    indexer_a.connect_block(&test_block2(&parser)).unwrap();
    let sequential = store_a.dump().unwrap();

    let (_dir_b, store_b, indexer_b) = setup_index(300);
    let chain = FakeChain::new();
    chain.add_block(test_block1(&parser));
    chain.add_block(test_block2(&parser));

    crate::sync::initial::connect_blocks_parallel(
        &indexer_b,
        chain.as_ref(),
        225_493,
        225_494,
        4,
        8,
        &AtomicBool::new(false),
    )
    .unwrap();

    assert_eq!(store_b.dump().unwrap(), sequential);
}

#[test]
fn unresolvable_inputs_are_recorded_empty() {
    let parser = testnet_parser();
    let (_dir, _store, indexer) = setup_index(300);

    // the input references a tx the index has never seen
    let block = Block {
        header: BlockHeader {
            height: 1,
            hash: [0xab; 32],
            prev_hash: [0u8; 32],
            time: 1_700_000_000,
            size: 100,
        },
        txs: vec![Tx {
            txid: [0x11; 32],
            vin: vec![spending(TXID_B2T2, 0)],
            vout: vec![output(&parser, ADDR1, 5_000)],
            locktime: 0,
            time: 1_700_000_000,
        }],
    };

    indexer.connect_block(&block).unwrap();

    let record = indexer.get_tx_addresses(&[0x11; 32]).unwrap().unwrap();
    assert_eq!(record.inputs.len(), 1);
    assert!(record.inputs[0].descriptor.is_empty());
    assert_eq!(record.inputs[0].value_sat, BigUint::ZERO);

    // the phantom input contributes nothing to any balance
    assert_eq!(
        indexer
            .get_address_balance(&descriptor_of(&parser, ADDR1))
            .unwrap(),
        Some(balance(1, 0, 5_000))
    );
}

#[test]
fn coinbase_inputs_are_skipped() {
    let parser = testnet_parser();
    let (_dir, _store, indexer) = setup_index(300);

    let block = Block {
        header: BlockHeader {
            height: 0,
            hash: [0xcd; 32],
            prev_hash: [0u8; 32],
            time: 1_700_000_000,
            size: 300,
        },
        txs: vec![Tx {
            txid: [0x22; 32],
            vin: vec![Vin { prevout: None }],
            vout: vec![output(&parser, ADDR1, 5_000_000_000)],
            locktime: 0,
            time: 1_700_000_000,
        }],
    };

    indexer.connect_block(&block).unwrap();

    let record = indexer.get_tx_addresses(&[0x22; 32]).unwrap().unwrap();
    assert!(record.inputs.is_empty());
    assert_eq!(
        indexer
            .get_address_balance(&descriptor_of(&parser, ADDR1))
            .unwrap(),
        Some(balance(1, 0, 5_000_000_000))
    );
}
