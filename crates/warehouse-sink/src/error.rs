//! Error types for the warehouse sink.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("BigQuery error: {0}")]
    BigQuery(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
