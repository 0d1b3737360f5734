//! Wire error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// CBOR encoding failed
    #[error("cbor encode failed: {0}")]
    Encode(String),

    /// CBOR decoding failed
    #[error("cbor decode failed: {0}")]
    Decode(String),

    /// Empty input
    #[error("empty record")]
    Empty,

    /// Malformed session id
    #[error("invalid session id: {0}")]
    SessionId(String),
}
