//! Error types for the per-repository scheduler.

use thiserror::Error;

/// Errors that can occur submitting work to the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The worker owning this key's queue has shut down.
    #[error("scheduler worker closed")]
    Closed,
}
