//! Error types for the firehose consumer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirehoseError {
    #[error("atproto error: {0}")]
    Atproto(#[from] atproto_core::AtprotoError),

    #[error("store error: {0}")]
    Store(#[from] ingest_store::StoreError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] repo_scheduler::SchedulerError),

    #[error("liveness threshold exceeded, no frames seen for {0}ms")]
    Stalled(i64),
}
