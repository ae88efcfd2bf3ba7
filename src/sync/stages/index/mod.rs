use std::sync::{Arc, Mutex};

use tracing::info;

use crate::{
    chain::{AddressDescriptor, BlockHash, ChainParser, Txid},
    define_table,
    error::Error,
    storage::{
        encdec::{malformed_input, prefix_key_range},
        table::Table,
        kv_store::{
            COLUMN_ADDRESS_BALANCE, COLUMN_ADDRESSES, COLUMN_BLOCK_ADDRESSES, COLUMN_BLOCK_TXIDS,
            COLUMN_DEFAULT, COLUMN_HEIGHT, COLUMN_TRANSACTIONS, COLUMN_TX_ADDRESSES, Store,
            StoreBatch,
        },
    },
};

pub mod connect;
pub mod disconnect;
pub mod records;
pub mod stage;

#[cfg(test)]
pub mod tests;

use records::{
    AddrTxRecords, AddressBalanceRecord, BlockAddressesRecord, BlockInfoRecord, BlockTxidsRecord,
    InternalStateRecord, PackedTxRecord, StatePoint, TxAddressesRecord,
};

pub const SCHEMA_VERSION: u32 = 1;

const INTERNAL_STATE_KEY: &[u8] = b"internalState";

fn be_height(height: &u32) -> Vec<u8> {
    height.to_be_bytes().to_vec()
}

fn decode_be_height(bytes: &[u8]) -> Result<u32, crate::storage::encdec::DecodingError> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| malformed_input("height key must be 4 bytes"))?;
    Ok(u32::from_be_bytes(array))
}

fn decode_txid_key(bytes: &[u8]) -> Result<Txid, crate::storage::encdec::DecodingError> {
    bytes
        .try_into()
        .map_err(|_| malformed_input("txid key must be 32 bytes"))
}

/// Key of one addresses-index row: descriptor bytes followed by the
/// big-endian height, so one address's history iterates chronologically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressKey {
    pub descriptor: AddressDescriptor,
    pub height: u32,
}

define_table! {
    name: HeightKV,
    column: COLUMN_HEIGHT,
    key_type: u32,
    value_type: BlockInfoRecord,
    encode_key: be_height,
    decode_key: decode_be_height
}

define_table! {
    name: AddressesKV,
    column: COLUMN_ADDRESSES,
    key_type: AddressKey,
    value_type: AddrTxRecords,
    encode_key: |key| {
        let mut out = Vec::with_capacity(key.descriptor.len() + 4);
        out.extend_from_slice(&key.descriptor);
        out.extend_from_slice(&key.height.to_be_bytes());
        out
    },
    decode_key: |bytes| {
        let Some(split) = bytes.len().checked_sub(4) else {
            return Err(malformed_input("address key too short"));
        };
        Ok(AddressKey {
            descriptor: bytes[..split].to_vec(),
            height: decode_be_height(&bytes[split..])?,
        })
    }
}

define_table! {
    name: BlockTxidsKV,
    column: COLUMN_BLOCK_TXIDS,
    key_type: u32,
    value_type: BlockTxidsRecord,
    encode_key: be_height,
    decode_key: decode_be_height
}

define_table! {
    name: TxAddressesKV,
    column: COLUMN_TX_ADDRESSES,
    key_type: Txid,
    value_type: TxAddressesRecord,
    encode_key: |txid| txid.to_vec(),
    decode_key: decode_txid_key
}

define_table! {
    name: AddressBalanceKV,
    column: COLUMN_ADDRESS_BALANCE,
    key_type: AddressDescriptor,
    value_type: AddressBalanceRecord,
    encode_key: |descriptor| descriptor.clone(),
    decode_key: |bytes| Ok(bytes.to_vec())
}

define_table! {
    name: BlockAddressesKV,
    column: COLUMN_BLOCK_ADDRESSES,
    key_type: u32,
    value_type: BlockAddressesRecord,
    encode_key: be_height,
    decode_key: decode_be_height
}

define_table! {
    name: TransactionsKV,
    column: COLUMN_TRANSACTIONS,
    key_type: Txid,
    value_type: PackedTxRecord,
    encode_key: |txid| txid.to_vec(),
    decode_key: decode_txid_key
}

define_table! {
    name: InternalStateKV,
    column: COLUMN_DEFAULT,
    key_type: (),
    value_type: InternalStateRecord,
    encode_key: |_| INTERNAL_STATE_KEY.to_vec(),
    decode_key: |_| Ok(())
}

/// One (descriptor, txid, direction) observation from a committed block,
/// handed to the subscription fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEvent {
    pub descriptor: AddressDescriptor,
    pub txid: Txid,
    pub is_input: bool,
}

#[derive(Debug)]
pub struct ConnectResult {
    pub point: StatePoint,
    pub address_events: Vec<AddressEvent>,
}

/// The block connect/disconnect engine. All store mutation in the process
/// goes through this type, one atomic batch per block.
pub struct Indexer {
    store: Arc<Store>,
    parser: Arc<dyn ChainParser>,
    state: Mutex<InternalStateRecord>,
    block_addresses_to_keep: u32,
}

impl Indexer {
    /// Mounts the index on an open store, creating the internal state on
    /// first use and refusing stores written by an incompatible schema or
    /// for a different coin.
    pub fn new(
        store: Arc<Store>,
        parser: Arc<dyn ChainParser>,
        block_addresses_to_keep: u32,
    ) -> Result<Self, Error> {
        let state = match store.get::<InternalStateKV>(&())? {
            Some(state) => {
                if state.schema_version != SCHEMA_VERSION {
                    return Err(Error::SchemaMismatch(format!(
                        "store has schema version {}, this build requires {}",
                        state.schema_version, SCHEMA_VERSION
                    )));
                }
                if state.coin != parser.coin_name() {
                    return Err(Error::SchemaMismatch(format!(
                        "store indexes coin '{}', configured coin is '{}'",
                        state.coin,
                        parser.coin_name()
                    )));
                }
                state
            }
            None => {
                let state = InternalStateRecord {
                    coin: parser.coin_name().to_string(),
                    schema_version: SCHEMA_VERSION,
                    best: None,
                    initial_sync: true,
                };
                let mut batch = store.batch();
                batch.put::<InternalStateKV>(&(), &state);
                store.commit(batch)?;
                state
            }
        };

        info!(
            coin = %state.coin,
            best = ?state.best.map(|p| p.height),
            "mounted index"
        );

        Ok(Self {
            store,
            parser,
            state: Mutex::new(state),
            block_addresses_to_keep,
        })
    }

    pub fn parser(&self) -> &Arc<dyn ChainParser> {
        &self.parser
    }

    pub fn best_block(&self) -> Option<StatePoint> {
        self.state.lock().expect("state lock poisoned").best
    }

    pub fn is_initial_sync(&self) -> bool {
        self.state.lock().expect("state lock poisoned").initial_sync
    }

    pub fn internal_state(&self) -> InternalStateRecord {
        self.state.lock().expect("state lock poisoned").clone()
    }

    /// Flips the initial-sync flag; persisted with the next commit.
    pub fn set_initial_sync(&self, initial_sync: bool) {
        self.state.lock().expect("state lock poisoned").initial_sync = initial_sync;
    }

    pub fn get_block_hash(&self, height: u32) -> Result<Option<BlockHash>, Error> {
        Ok(self.store.get::<HeightKV>(&height)?.map(|info| info.hash))
    }

    pub fn get_block_info(&self, height: u32) -> Result<Option<BlockInfoRecord>, Error> {
        self.store.get::<HeightKV>(&height)
    }

    pub fn get_tx_addresses(&self, txid: &Txid) -> Result<Option<TxAddressesRecord>, Error> {
        self.store.get::<TxAddressesKV>(txid)
    }

    pub fn get_address_balance(
        &self,
        descriptor: &AddressDescriptor,
    ) -> Result<Option<AddressBalanceRecord>, Error> {
        self.store.get::<AddressBalanceKV>(descriptor)
    }

    /// Calls `f` for every contribution of `descriptor` within the
    /// inclusive height range, in chronological then block-append order.
    /// The io index is the vout for outputs and the input index within the
    /// spending tx for inputs.
    pub fn get_transactions(
        &self,
        descriptor: &AddressDescriptor,
        lower: u32,
        higher: u32,
        mut f: impl FnMut(Txid, u32, bool) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let iter = if lower == 0 && higher == u32::MAX {
            self.store.iterate_prefix::<AddressesKV>(descriptor)
        } else {
            let start = AddressesKV::encode_key(&AddressKey {
                descriptor: descriptor.clone(),
                height: lower,
            });
            let end = match higher.checked_add(1) {
                Some(above) => AddressesKV::encode_key(&AddressKey {
                    descriptor: descriptor.clone(),
                    height: above,
                }),
                None => prefix_key_range(descriptor).end,
            };
            self.store.iterate_range::<AddressesKV>(start..end)
        };

        for item in iter {
            let (key, records) = item?;
            if key.descriptor != *descriptor {
                continue;
            }
            for record in records.0 {
                f(record.txid, record.io_index, !record.is_input)?;
            }
        }

        Ok(())
    }

    /// Writes the advanced internal state into the batch; the in-memory
    /// copy is swapped in by [`Self::commit_state`] after the batch lands.
    fn stage_state(
        &self,
        batch: &mut StoreBatch<'_>,
        best: Option<StatePoint>,
    ) -> InternalStateRecord {
        let mut state = self.state.lock().expect("state lock poisoned").clone();
        state.best = best;
        batch.put::<InternalStateKV>(&(), &state);
        state
    }

    fn commit_state(&self, state: InternalStateRecord) {
        *self.state.lock().expect("state lock poisoned") = state;
    }
}
