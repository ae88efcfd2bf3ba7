use std::{ops::Range, path::PathBuf, sync::Arc};

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, ReadOptions, WriteBatch};
use tracing::info;

use crate::error::Error;

use super::{
    encdec::{Decode, Encode, prefix_key_range},
    table::{Table, TableIterator},
};

/// Column family for the internal state sentinel.
pub const COLUMN_DEFAULT: &str = "default";
pub const COLUMN_HEIGHT: &str = "height";
pub const COLUMN_ADDRESSES: &str = "addresses";
pub const COLUMN_BLOCK_TXIDS: &str = "blockTxids";
pub const COLUMN_TX_ADDRESSES: &str = "txAddresses";
pub const COLUMN_ADDRESS_BALANCE: &str = "addressBalance";
pub const COLUMN_BLOCK_ADDRESSES: &str = "blockAddresses";
pub const COLUMN_TRANSACTIONS: &str = "transactions";

pub const COLUMNS: [&str; 8] = [
    COLUMN_DEFAULT,
    COLUMN_HEIGHT,
    COLUMN_ADDRESSES,
    COLUMN_BLOCK_TXIDS,
    COLUMN_TX_ADDRESSES,
    COLUMN_ADDRESS_BALANCE,
    COLUMN_BLOCK_ADDRESSES,
    COLUMN_TRANSACTIONS,
];

/// Ordered key-value store with one named column family per logical table.
/// All mutation goes through [`StoreBatch`]; a batch commits atomically, so
/// concurrent readers observe either all or none of a block's effects.
pub struct Store {
    db: Arc<DB>,
}

impl Store {
    pub fn open(path: PathBuf, memory_budget: usize) -> Result<Self, Error> {
        info!(path = %path.display(), "opening store");

        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let cfs = COLUMNS
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.optimize_level_style_compaction(memory_budget / COLUMNS.len());
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, &path, cfs)?;

        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn cf(&self, name: &'static str) -> &ColumnFamily {
        self.db.cf_handle(name).expect("column family missing")
    }

    pub fn get<T: Table>(&self, key: &T::Key) -> Result<Option<T::Value>, Error> {
        let raw_key = T::encode_key(key);

        self.db
            .get_cf(self.cf(T::COLUMN), &raw_key)?
            .map(|bytes| {
                T::Value::decode_all(&bytes).map_err(|e| Error::corrupt(T::COLUMN, &raw_key, e))
            })
            .transpose()
    }

    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch {
            store: self,
            batch: WriteBatch::new(),
        }
    }

    /// Applies the batch atomically; durable on return.
    pub fn commit(&self, batch: StoreBatch) -> Result<(), Error> {
        self.db.write(batch.batch)?;
        Ok(())
    }

    /// Forward iteration over all keys starting with `prefix`.
    pub fn iterate_prefix<T: Table>(&self, prefix: &[u8]) -> TableIterator<'_, T> {
        self.iterate_range::<T>(prefix_key_range(prefix))
    }

    /// Forward iteration over `[range.start, range.end)` in raw key order.
    /// An empty `range.end` means unbounded above.
    pub fn iterate_range<T: Table>(&self, range: Range<Vec<u8>>) -> TableIterator<'_, T> {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_lower_bound(range.start);
        if !range.end.is_empty() {
            read_opts.set_iterate_upper_bound(range.end);
        }

        let iter =
            self.db
                .iterator_cf_opt(self.cf(T::COLUMN), read_opts, rocksdb::IteratorMode::Start);

        TableIterator::<T>::new(iter)
    }

    pub fn iterate_all<T: Table>(&self) -> TableIterator<'_, T> {
        let iter = self
            .db
            .iterator_cf(self.cf(T::COLUMN), rocksdb::IteratorMode::Start);

        TableIterator::<T>::new(iter)
    }

    /// Raw dump of every column, for state snapshots in tests and the
    /// operator dump endpoint.
    pub fn dump(&self) -> Result<Vec<(&'static str, Vec<u8>, Vec<u8>)>, Error> {
        let mut out = Vec::new();
        for column in COLUMNS {
            for item in self.db.iterator_cf(self.cf(column), rocksdb::IteratorMode::Start) {
                let (key, value) = item?;
                out.push((column, key.to_vec(), value.to_vec()));
            }
        }
        Ok(out)
    }

    pub fn estimated_keys(&self, column: &'static str) -> u64 {
        self.db
            .property_int_value_cf(self.cf(column), "rocksdb.estimate-num-keys")
            .ok()
            .flatten()
            .unwrap_or(0)
    }
}

/// Accumulates multi-column puts and deletes for one atomic commit.
pub struct StoreBatch<'a> {
    store: &'a Store,
    batch: WriteBatch,
}

impl StoreBatch<'_> {
    pub fn put<T: Table>(&mut self, key: &T::Key, value: &T::Value) {
        self.batch
            .put_cf(self.store.cf(T::COLUMN), T::encode_key(key), value.encode());
    }

    pub fn delete<T: Table>(&mut self, key: &T::Key) {
        self.batch
            .delete_cf(self.store.cf(T::COLUMN), T::encode_key(key));
    }
}
