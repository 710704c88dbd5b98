//! Keyed parallel per-repository scheduler.
//!
//! Bounds concurrency across many repositories while preserving per-key
//! (per-repository) ordering — see [`Scheduler`] for the mailbox-per-worker
//! design.

mod error;
mod scheduler;
mod types;

pub use error::SchedulerError;
pub use scheduler::Scheduler;
pub use types::SchedulerConfig;
