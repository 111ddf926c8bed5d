//! Bounded pool of worker tasks with a runtime-adjustable cap.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("worker pool is closed")]
pub struct PoolClosed;

/// A pool that never runs more than its cap of tasks at once. `submit` waits
/// for capacity, so saturated callers experience back-pressure instead of
/// unbounded task growth.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    permits: Arc<Semaphore>,
    cap: Mutex<usize>,
    tasks: TaskTracker,
}

impl WorkerPool {
    /// `workers` caps concurrency; `None` defaults to the number of logical
    /// CPUs. The cap is always at least 1.
    pub fn new(workers: Option<usize>) -> Self {
        let cap = workers.unwrap_or_else(default_workers).max(1);
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(cap)),
                cap: Mutex::new(cap),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Schedule a unit of work. Waits while the pool is saturated; fails once
    /// the pool has been closed.
    pub async fn submit<F>(&self, work: F) -> Result<(), PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.tasks.is_closed() {
            return Err(PoolClosed);
        }
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;
        self.inner.tasks.spawn(async move {
            work.await;
            drop(permit);
        });
        Ok(())
    }

    /// Adjust the cap to `n` (clamped to at least 1). Raising the cap takes
    /// effect immediately; lowering it lets running tasks finish and retires
    /// the excess capacity as it frees up.
    pub fn tune(&self, n: usize) {
        let n = n.max(1);
        let mut cap = self
            .inner
            .cap
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if n > *cap {
            self.inner.permits.add_permits(n - *cap);
        } else if n < *cap {
            let excess = (*cap - n) as u32;
            let permits = Arc::clone(&self.inner.permits);
            tokio::spawn(async move {
                if let Ok(taken) = permits.acquire_many_owned(excess).await {
                    taken.forget();
                }
            });
        }
        debug!(from = *cap, to = n, "tuned worker pool cap");
        *cap = n;
    }

    /// Refuse new submissions and wait for every in-flight task to finish.
    pub async fn close(&self) {
        self.inner.tasks.close();
        self.inner.permits.close();
        self.inner.tasks.wait().await;
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}
