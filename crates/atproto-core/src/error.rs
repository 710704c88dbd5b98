//! Error types for firehose transport and commit decoding.

use thiserror::Error;

/// Errors that can occur while decoding and transporting AT Protocol data.
#[derive(Debug, Error)]
pub enum AtprotoError {
    /// CAR parsing error.
    #[error("CAR parse error: {0}")]
    CarParse(String),

    /// CBOR decoding error.
    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    /// Declared content hash did not match the recomputed hash of the block bytes.
    #[error("CID mismatch at {path}: declared {declared}, computed {computed}")]
    CidMismatch {
        path: String,
        declared: String,
        computed: String,
    },

    /// A record path did not parse into `collection/rkey`.
    #[error("malformed record path: {0}")]
    MalformedPath(String),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}
