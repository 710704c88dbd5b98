//! Keyed parallel worker-pool scheduler.
//!
//! Provides bounded parallelism while preserving per-key ordering: all items
//! submitted under the same key are handled, in submission order, by the
//! same worker. This is a fixed mailbox-per-worker design, not one task per
//! key — a busy repository never spawns more than the one task its worker
//! already has, and an idle repository costs nothing beyond a hash lookup.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{SchedulerConfig, SchedulerError};

/// A pool of keyed workers processing items of type `T`.
pub struct Scheduler<T> {
    senders: Vec<mpsc::Sender<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Scheduler<T> {
    /// Spawn `config.workers` tasks, each driven by `handler`, and return a
    /// handle that can submit keyed work to them.
    pub fn spawn<F, Fut>(config: SchedulerConfig, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handler = Arc::new(handler);
        let mut senders = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);

        for worker_id in 0..config.workers {
            let (tx, mut rx) = mpsc::channel::<T>(config.queue_depth);
            let handler = Arc::clone(&handler);

            let handle = tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    handler(item).await;
                }
                debug!(worker_id, "scheduler worker drained");
            });

            senders.push(tx);
            handles.push(handle);
        }

        Self { senders, handles }
    }

    /// Route `item` to the worker owning `key`, preserving ordering for that
    /// key. Backpressures (awaits) once that worker's queue is full; fails
    /// only once the worker has shut down.
    pub async fn submit(&self, key: &str, item: T) -> Result<(), SchedulerError> {
        let idx = worker_index(key, self.senders.len());
        self.senders[idx]
            .send(item)
            .await
            .map_err(|_| SchedulerError::Closed)
    }

    /// Stop accepting new work and wait for every worker to drain its queue.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler worker task panicked");
            }
        }
    }
}

fn worker_index(key: &str, worker_count: usize) -> usize {
    if worker_count <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % worker_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_worker_index_is_stable_for_same_key() {
        assert_eq!(worker_index("did:plc:abc", 10), worker_index("did:plc:abc", 10));
    }

    #[test]
    fn test_worker_index_single_worker() {
        assert_eq!(worker_index("anything", 1), 0);
    }

    #[tokio::test]
    async fn test_items_processed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let scheduler = Scheduler::spawn(
            SchedulerConfig {
                workers: 4,
                queue_depth: 8,
            },
            move |item: i32| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    seen.lock().unwrap().push(item);
                }
            },
        );

        for i in 0..20 {
            scheduler.submit("key-a", i).await.unwrap();
        }
        scheduler.shutdown().await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_same_key_processed_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = Arc::clone(&order);
        let scheduler = Scheduler::spawn(
            SchedulerConfig {
                workers: 8,
                queue_depth: 16,
            },
            move |item: usize| {
                let order = Arc::clone(&order_clone);
                async move {
                    order.lock().unwrap().push(item);
                }
            },
        );

        for i in 0..50 {
            scheduler.submit("repo-one", i).await.unwrap();
        }
        scheduler.shutdown().await;

        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let scheduler = Scheduler::spawn(SchedulerConfig::default(), move |_: ()| {
            let counter = Arc::clone(&counter_clone);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        scheduler.submit("k", ()).await.unwrap();
        scheduler.shutdown().await;
        // scheduler is consumed by shutdown; nothing further to submit to.
    }
}
