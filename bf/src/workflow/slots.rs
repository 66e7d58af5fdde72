//! System-wide run slot manager
//!
//! Caps the number of simultaneously running runs. Per-item ordering is
//! the queue manager's job; this only enforces the global concurrency
//! budget. A slot is held while a run executes stages and released while
//! it waits on a human.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Slot usage statistics
#[derive(Debug, Default, Clone)]
pub struct SlotStats {
    pub total_acquired: u64,
    pub peak_concurrent: usize,
}

struct SchedulerInner {
    running: HashSet<String>,
    stats: SlotStats,
}

/// The run slot manager
pub struct RunScheduler {
    semaphore: Arc<Semaphore>,
    inner: Mutex<SchedulerInner>,
    max_concurrent: usize,
}

impl RunScheduler {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        let max_concurrent = max_concurrent.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            inner: Mutex::new(SchedulerInner {
                running: HashSet::new(),
                stats: SlotStats::default(),
            }),
            max_concurrent,
        })
    }

    /// Wait for a slot and register the run as running
    pub async fn acquire(self: &Arc<Self>, run_id: &str) -> RunSlot {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("run scheduler semaphore closed");

        let mut inner = self.inner.lock().expect("slot lock poisoned");
        inner.running.insert(run_id.to_string());
        inner.stats.total_acquired += 1;
        let concurrent = inner.running.len();
        inner.stats.peak_concurrent = inner.stats.peak_concurrent.max(concurrent);
        drop(inner);

        debug!(run_id, concurrent, "Run slot acquired");
        RunSlot {
            _permit: permit,
            run_id: run_id.to_string(),
            scheduler: self.clone(),
        }
    }

    /// Number of runs currently holding a slot
    pub fn running_count(&self) -> usize {
        self.inner.lock().expect("slot lock poisoned").running.len()
    }

    /// Free slots remaining
    pub fn available(&self) -> usize {
        self.max_concurrent.saturating_sub(self.running_count())
    }

    pub fn stats(&self) -> SlotStats {
        self.inner.lock().expect("slot lock poisoned").stats.clone()
    }

    fn release(&self, run_id: &str) {
        let mut inner = self.inner.lock().expect("slot lock poisoned");
        inner.running.remove(run_id);
        debug!(run_id, concurrent = inner.running.len(), "Run slot released");
    }
}

/// A held run slot; dropping it frees the slot
pub struct RunSlot {
    _permit: OwnedSemaphorePermit,
    run_id: String,
    scheduler: Arc<RunScheduler>,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.scheduler.release(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let scheduler = RunScheduler::new(2);

        let a = scheduler.acquire("run_a").await;
        let b = scheduler.acquire("run_b").await;
        assert_eq!(scheduler.running_count(), 2);
        assert_eq!(scheduler.available(), 0);

        drop(a);
        assert_eq!(scheduler.running_count(), 1);
        assert_eq!(scheduler.available(), 1);
        drop(b);
        assert_eq!(scheduler.running_count(), 0);
    }

    #[tokio::test]
    async fn test_cap_blocks_third_run() {
        let scheduler = RunScheduler::new(2);

        let _a = scheduler.acquire("run_a").await;
        let b = scheduler.acquire("run_b").await;

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.acquire("run_c").await })
        };

        // Third acquisition must not complete while both slots are held
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(b);
        let slot = waiter.await.unwrap();
        assert_eq!(scheduler.running_count(), 2);
        drop(slot);
    }

    #[tokio::test]
    async fn test_stats_track_peak() {
        let scheduler = RunScheduler::new(3);

        let a = scheduler.acquire("a").await;
        let b = scheduler.acquire("b").await;
        drop(a);
        let c = scheduler.acquire("c").await;

        let stats = scheduler.stats();
        assert_eq!(stats.total_acquired, 3);
        assert_eq!(stats.peak_concurrent, 2);
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn test_zero_cap_is_clamped() {
        let scheduler = RunScheduler::new(0);
        let slot = scheduler.acquire("run_a").await;
        assert_eq!(scheduler.running_count(), 1);
        drop(slot);
    }
}
