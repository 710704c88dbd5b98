//! Scheduler configuration.

/// Tunables for [`crate::Scheduler`].
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Number of worker tasks. Each owns one bounded queue and processes its
    /// items strictly in submission order.
    pub workers: usize,
    /// Capacity of each worker's queue. Submission blocks (backpressures)
    /// once a worker's queue is full rather than dropping work.
    pub queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_depth: 100,
        }
    }
}
