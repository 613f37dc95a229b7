//! Engine worker pool.
//!
//! Workers are created once at startup and rooms are assigned to them
//! round-robin. A worker death is unrecoverable: the pool's death
//! watchers latch the failure token immediately, then cancel the root
//! token after a short delay so in-flight requests can fail cleanly
//! before the actors stop.

use crate::errors::BrokerError;
use media_engine::{EngineWorker, MediaEngine, WorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Delay between latching the failure token and cancelling the root
/// token, giving callers a window to observe the failure.
pub const FAILURE_FLUSH_DELAY: Duration = Duration::from_secs(2);

/// Fixed set of engine workers with round-robin room assignment.
pub struct WorkerPool {
    workers: Vec<Arc<dyn EngineWorker>>,
    next: usize,
}

impl WorkerPool {
    /// Create `worker_count` workers up front.
    pub async fn build(
        engine: &dyn MediaEngine,
        worker_count: usize,
        settings: &WorkerSettings,
    ) -> Result<Self, BrokerError> {
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            workers.push(engine.create_worker(settings).await?);
        }
        Ok(Self { workers, next: 0 })
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Assign the next worker round-robin.
    ///
    /// Returns the worker's pool index alongside the worker so callers
    /// can report placement.
    pub fn assign(&mut self) -> Result<(usize, Arc<dyn EngineWorker>), BrokerError> {
        let Some(worker) = self.workers.get(self.next) else {
            return Err(BrokerError::Internal("worker pool is empty".to_string()));
        };
        let index = self.next;
        self.next = (self.next + 1) % self.workers.len();
        Ok((index, Arc::clone(worker)))
    }

    /// Spawn one watcher task per worker.
    ///
    /// When any worker dies the watcher latches `failure`, waits
    /// [`FAILURE_FLUSH_DELAY`], then cancels `root` to bring the whole
    /// broker down. Watchers exit quietly when `root` is cancelled
    /// first (normal shutdown).
    pub fn spawn_death_watchers(&self, root: &CancellationToken, failure: &CancellationToken) {
        for (index, worker) in self.workers.iter().enumerate() {
            let death = worker.death_watch();
            let root = root.clone();
            let failure = failure.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = root.cancelled() => {}
                    () = death.cancelled() => {
                        error!(
                            target: "broker.pool",
                            worker_index = index,
                            "Engine worker died, shutting down broker"
                        );
                        failure.cancel();
                        tokio::time::sleep(FAILURE_FLUSH_DELAY).await;
                        root.cancel();
                    }
                }
            });
        }
    }
}
