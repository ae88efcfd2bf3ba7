use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;

use crate::error::Error;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("unknown method")]
    UnknownMethod,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Engine(#[from] Error),

    /// Caught panic inside a handler; the client sees an opaque message.
    #[error("Internal error")]
    Internal,
}

impl ServeError {
    pub fn bad_request(msg: impl ToString) -> Self {
        ServeError::BadRequest(msg.to_string())
    }

    /// The wire error shape: `{ "error": { "message": ... } }`.
    pub fn to_wire(&self) -> Value {
        let message = match self {
            // internal detail stays in the log
            ServeError::Engine(Error::Internal(detail)) => {
                error!("internal error: {detail}");
                "Internal error".to_string()
            }
            ServeError::Engine(inner @ Error::CorruptRecord { .. }) => {
                error!("corrupt record surfaced to client: {inner}");
                inner.to_string()
            }
            other => other.to_string(),
        };

        json!({ "error": { "message": message } })
    }
}
