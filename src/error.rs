use thiserror::Error;

use crate::storage::encdec::DecodingError;

#[derive(Error, Debug)]
pub enum Error {
    /// Requested entity (address, tx, block) is not indexed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persisted bytes failed to decode. Never swallowed; carries the
    /// column family and key so the damage can be located.
    #[error("corrupt record in column '{column}' key {key}: {source}")]
    CorruptRecord {
        column: &'static str,
        key: String,
        source: DecodingError,
    },

    /// Store was written by an incompatible version. Fatal on startup.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// RPC / transport failure talking to the backing node.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Caught panic or violated invariant. The user sees an opaque message,
    /// the log gets the detail.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),
}

impl Error {
    pub fn not_found(what: impl ToString) -> Error {
        Error::NotFound(what.to_string())
    }

    pub fn corrupt(column: &'static str, key: &[u8], source: DecodingError) -> Error {
        Error::CorruptRecord {
            column,
            key: hex::encode(key),
            source,
        }
    }

    pub fn unsupported(what: impl ToString) -> Error {
        Error::UnsupportedOperation(what.to_string())
    }

    pub fn backend(error: impl ToString) -> Error {
        Error::Backend(error.to_string())
    }

    pub fn invalid(what: impl ToString) -> Error {
        Error::InvalidArgument(what.to_string())
    }

    pub fn internal(what: impl ToString) -> Error {
        Error::Internal(what.to_string())
    }
}

impl From<bitcoincore_rpc::Error> for Error {
    fn from(err: bitcoincore_rpc::Error) -> Self {
        Error::Backend(err.to_string())
    }
}
