use super::{ExecutionFacility, Work};
use crate::core::errors::{FlowError, Result};
use crate::core::limits::{PoolLimits, PoolTracker, PoolUsageStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Bounded worker pool on a tokio runtime.
///
/// Every accepted unit is spawned right away and then waits for one of
/// `max_workers` permits, so queued work is held by the runtime rather
/// than dropped.
pub struct WorkerPool {
    handle: Handle,
    semaphore: Arc<Semaphore>,
    tracker: Arc<PoolTracker>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create a pool on the runtime the caller is running in
    pub fn new(limits: PoolLimits) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            FlowError::configuration(format!("worker pool needs a tokio runtime: {}", e))
        })?;
        Self::with_handle(limits, handle)
    }

    pub fn with_handle(limits: PoolLimits, handle: Handle) -> Result<Self> {
        let workers = limits.max_workers;
        let tracker = PoolTracker::new(limits)?;
        info!("Worker pool started with {} workers", workers);

        Ok(Self {
            handle,
            semaphore: Arc::new(Semaphore::new(workers)),
            tracker: Arc::new(tracker),
            closed: AtomicBool::new(false),
        })
    }

    /// Stop accepting work; units already accepted still run
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Worker pool shutting down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolUsageStats {
        self.tracker.get_usage_stats()
    }

    pub fn limits(&self) -> &PoolLimits {
        self.tracker.get_limits()
    }
}

impl ExecutionFacility for WorkerPool {
    fn submit(&self, work: Work) -> Result<()> {
        if self.is_shutdown() {
            self.tracker.record_rejected();
            warn!("Rejected submission to a shut down worker pool");
            return Err(FlowError::cancelled("submit").with_reason("worker pool shut down"));
        }

        self.tracker.record_submitted();
        let semaphore = self.semaphore.clone();
        let tracker = self.tracker.clone();

        self.handle.spawn(async move {
            // The semaphore is never closed, so acquisition only waits
            let _permit = semaphore.acquire_owned().await.ok();
            let _execution = tracker.start_task();
            work.await;
        });
        debug!("Submitted unit of work");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(PoolLimits { max_workers: 2 }).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let tx = tx.clone();
            pool.submit(
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(());
                }
                .boxed(),
            )
            .unwrap();
        }

        for _ in 0..6 {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("pool dropped work");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.stats().total_submitted, 6);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let pool = WorkerPool::new(PoolLimits::default()).unwrap();
        pool.shutdown();

        let err = pool.submit(async {}.boxed()).unwrap_err();
        assert!(matches!(err, FlowError::Cancelled { .. }));
        assert_eq!(pool.stats().total_rejected, 1);
    }

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(
            WorkerPool::new(PoolLimits::default()),
            Err(FlowError::Configuration { .. })
        ));
    }
}
