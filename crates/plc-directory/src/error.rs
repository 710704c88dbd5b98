//! Error types for directory ingestion and DID-document projection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] ingest_store::StoreError),

    #[error("subject not found: {0}")]
    NotFound(String),

    #[error("malformed operation for {subject}: {reason}")]
    Projection { subject: String, reason: String },
}
