use std::marker::PhantomData;

use rocksdb::DB;

use crate::error::Error;

use super::encdec::{Decode, DecodingError, Encode};

/// A typed table bound to one named column family. Keys have their own
/// encoding (big-endian heights, raw descriptors) so that the column's
/// lexicographic order is the chronological / prefix order the indexer
/// relies on; values go through the regular codecs.
pub trait Table {
    /// Column family name.
    const COLUMN: &'static str;

    type Key;
    type Value: Encode + Decode;

    fn encode_key(key: &Self::Key) -> Vec<u8>;

    fn decode_key(bytes: &[u8]) -> Result<Self::Key, DecodingError>;
}

type RocksIterator<'a> = rocksdb::DBIteratorWithThreadMode<'a, DB>;

pub struct TableIterator<'a, T>(RocksIterator<'a>, PhantomData<T>);

impl<'a, T> TableIterator<'a, T> {
    pub fn new(inner: RocksIterator<'a>) -> Self {
        Self(inner, Default::default())
    }
}

impl<T> Iterator for TableIterator<'_, T>
where
    T: Table,
{
    type Item = Result<(T::Key, T::Value), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.0.next() {
            Some(Ok((key, value))) => {
                let key_out = match T::decode_key(&key) {
                    Ok(k) => k,
                    Err(e) => return Some(Err(Error::corrupt(T::COLUMN, &key, e))),
                };

                let value_out = match T::Value::decode_all(&value) {
                    Ok(v) => v,
                    Err(e) => return Some(Err(Error::corrupt(T::COLUMN, &key, e))),
                };

                Some(Ok((key_out, value_out)))
            }
            Some(Err(err)) => Some(Err(err.into())),
            None => None,
        }
    }
}

#[macro_export]
macro_rules! define_table {
    {
        name: $name:ident,
        column: $column:expr,
        key_type: $key_type:ty,
        value_type: $value_type:ty,
        encode_key: $encode_key:expr,
        decode_key: $decode_key:expr
    } => {
        pub struct $name;

        impl $crate::storage::table::Table for $name {
            const COLUMN: &'static str = $column;
            type Key = $key_type;
            type Value = $value_type;

            fn encode_key(key: &Self::Key) -> Vec<u8> {
                let encode: fn(&Self::Key) -> Vec<u8> = $encode_key;
                encode(key)
            }

            fn decode_key(
                bytes: &[u8],
            ) -> Result<Self::Key, $crate::storage::encdec::DecodingError> {
                let decode: fn(&[u8]) -> Result<Self::Key, $crate::storage::encdec::DecodingError> =
                    $decode_key;
                decode(bytes)
            }
        }
    };
}
