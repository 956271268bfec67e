//! Internal error taxonomy. Never surfaced verbatim to a client: session and
//! pipeline code translate these into client-facing reason strings instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("storage operation timed out")]
    StorageTimeout,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

pub type RelayResult<T> = Result<T, RelayError>;
