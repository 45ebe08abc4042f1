use crate::core::errors::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

/// Bounds for the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolLimits {
    /// Maximum number of units of work executing at once
    pub max_workers: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

impl PoolLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(FlowError::configuration(
                "max_workers must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Pool usage tracker
#[derive(Debug)]
pub struct PoolTracker {
    limits: PoolLimits,

    // Current usage counters
    queued: AtomicUsize,
    running: AtomicUsize,

    // Statistics
    peak_running: AtomicUsize,
    total_submitted: AtomicU64,
    total_completed: AtomicU64,
    total_rejected: AtomicU64,
}

impl PoolTracker {
    pub fn new(limits: PoolLimits) -> Result<Self> {
        limits.validate()?;

        Ok(Self {
            limits,
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            total_submitted: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        })
    }

    /// Record a unit of work accepted for execution
    pub fn record_submitted(&self) {
        self.total_submitted.fetch_add(1, Ordering::Relaxed);
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a submission turned away
    pub fn record_rejected(&self) {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Move a queued unit to running; the guard ends it on drop
    pub fn start_task(&self) -> TaskExecution<'_> {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        let running = self.running.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_running.fetch_max(running, Ordering::Relaxed);
        debug!("Started task, running: {}", running);

        TaskExecution {
            tracker: self,
            start_time: Instant::now(),
        }
    }

    fn end_task(&self, start_time: Instant) {
        let running = self.running.fetch_sub(1, Ordering::Relaxed) - 1;
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Ended task, running: {}, duration: {:?}",
            running,
            start_time.elapsed()
        );
    }

    /// Get current pool usage statistics
    pub fn get_usage_stats(&self) -> PoolUsageStats {
        PoolUsageStats {
            queued: self.queued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            peak_running: self.peak_running.load(Ordering::Relaxed),
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    pub fn get_limits(&self) -> &PoolLimits {
        &self.limits
    }
}

/// RAII task execution tracker
pub struct TaskExecution<'a> {
    tracker: &'a PoolTracker,
    start_time: Instant,
}

impl Drop for TaskExecution<'_> {
    fn drop(&mut self) {
        self.tracker.end_task(self.start_time);
    }
}

/// Pool usage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolUsageStats {
    pub queued: usize,
    pub running: usize,
    pub peak_running: usize,
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_limits_validation() {
        let mut limits = PoolLimits::default();
        assert!(limits.validate().is_ok());

        limits.max_workers = 0;
        assert!(limits.validate().is_err());
        assert!(PoolTracker::new(limits).is_err());
    }

    #[test]
    fn test_task_execution() {
        let tracker = PoolTracker::new(PoolLimits { max_workers: 2 }).unwrap();

        tracker.record_submitted();
        tracker.record_submitted();
        let first = tracker.start_task();
        assert_eq!(tracker.get_usage_stats().running, 1);
        assert_eq!(tracker.get_usage_stats().queued, 1);

        let second = tracker.start_task();
        drop(first);
        drop(second);

        let stats = tracker.get_usage_stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.peak_running, 2);
        assert_eq!(stats.total_completed, 2);
    }
}
