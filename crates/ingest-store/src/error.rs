//! Error types for the embedded store.

use thiserror::Error;

/// Errors that can occur opening or operating on the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}
