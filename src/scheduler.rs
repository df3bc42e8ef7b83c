//! Bounded worker pool for dataset migrations.
//!
//! Tasks flow through a bounded channel consumed by a fixed number of
//! workers, so at most `workers` handlers run at any moment.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::error;

use crate::config::DEFAULT_CONCURRENCY;

/// Slot occupancy counters shared by all workers of a pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl PoolStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> SlotGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        SlotGuard {
            stats: Arc::clone(self),
        }
    }
}

/// Released on drop, including when the handler panics.
struct SlotGuard {
    stats: Arc<PoolStats>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.stats.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    stats: Arc<PoolStats>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Runs `handler` over every item and returns one slot per item, in input order.
    ///
    /// No fail-fast: a handler that panics leaves `None` in its own slot and
    /// its worker moves on to the next item.
    pub async fn run<Item, R, F, Fut>(&self, items: Vec<Item>, handler: F) -> Vec<Option<R>>
    where
        Item: Send + 'static,
        R: Send + 'static,
        F: Fn(Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = items.len();
        let (task_tx, task_rx) = mpsc::channel::<(usize, Item)>(self.workers);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, R)>();
        let handler = Arc::new(handler);

        let mut workers = JoinSet::new();
        for _ in 0..self.workers.min(total.max(1)) {
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let handler = Arc::clone(&handler);
            let stats = Arc::clone(&self.stats);
            workers.spawn(async move {
                loop {
                    let next = task_rx.lock().await.recv().await;
                    let Some((index, item)) = next else {
                        break;
                    };
                    let slot = stats.enter();
                    let result = AssertUnwindSafe(handler(item)).catch_unwind().await;
                    drop(slot);
                    let Ok(result) = result else {
                        error!(index, "handler panicked");
                        continue;
                    };
                    if result_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for task in items.into_iter().enumerate() {
            if task_tx.send(task).await.is_err() {
                error!("all workers exited before the queue drained");
                break;
            }
        }
        drop(task_tx);

        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        while let Some((index, result)) = result_rx.recv().await {
            results[index] = Some(result);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!("worker terminated abnormally: {err}");
            }
        }

        results
    }
}
