//! Bounded dispatch of fire-and-forget work
//!
//! `spawn` never blocks the caller. The spawned task waits for a permit, so at
//! most `limit` dispatched items run at once and the rest queue inside tokio.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl TaskPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Items currently holding a permit
    pub fn running(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!("task pool closed, dropping work item");
                return;
            };
            work.await;
        });
    }

    /// Refuse further work; queued items are dropped
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_runs_work() {
        let pool = TaskPool::new(2);
        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.spawn(async move {
            let _ = tx.send(7);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = TaskPool::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..6 {
            let peak = peak.clone();
            let current = current.clone();
            let done_tx = done_tx.clone();
            pool.spawn(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        }
        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_zero_limit_clamped() {
        assert_eq!(TaskPool::new(0).limit(), 1);
    }
}
