//! Single-worker FIFO scheduler.

use std::time::{Duration, Instant};

use crate::config::{SchedulerConfig, SchedulerKind};
use crate::core::{CancelToken, SchedulerError};

use super::workers::ThreadedBackend;
use super::{RepeatingWork, Scheduler, SchedulerStats, Work};

/// Runs work one item at a time, in submission order, on one dedicated thread.
///
/// Work never runs concurrently with other work on the same queue, so state
/// touched only from this queue needs no further locking.
pub struct SerialQueue {
    backend: ThreadedBackend,
}

impl SerialQueue {
    /// Create a serial queue with default depth and stack size.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the worker or timer thread cannot be spawned.
    pub fn new(label: impl Into<String>) -> Result<Self, SchedulerError> {
        Self::from_config(&SchedulerConfig::new(SchedulerKind::Serial).with_label(label))
    }

    /// Create a serial queue from configuration. `worker_count` is ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if validation fails, `Backend` if threads cannot
    /// be spawned.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        Ok(Self {
            backend: ThreadedBackend::new(config, 1)?,
        })
    }
}

impl Scheduler for SerialQueue {
    fn label(&self) -> &str {
        self.backend.label()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule_now(&self, work: Work) -> Result<(), SchedulerError> {
        self.backend.schedule_now(work)
    }

    fn schedule_after(
        &self,
        delay: Duration,
        tolerance: Duration,
        work: Work,
    ) -> Result<CancelToken, SchedulerError> {
        self.backend.schedule_after(delay, tolerance, work)
    }

    fn schedule_repeating(
        &self,
        interval: Duration,
        work: RepeatingWork,
    ) -> Result<CancelToken, SchedulerError> {
        self.backend.schedule_repeating(interval, work)
    }

    fn shutdown(&self) {
        self.backend.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }

    fn stats(&self) -> SchedulerStats {
        self.backend.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SchedulerExt;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_serial_preserves_order() {
        let queue = SerialQueue::new("serial-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            queue.run_now(move || seen.lock().push(i)).unwrap();
        }
        queue.run_now(move || done_tx.send(()).unwrap()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        queue.shutdown();
    }

    #[test]
    fn test_full_queue_is_reported() {
        let config = SchedulerConfig::new(SchedulerKind::Serial)
            .with_label("serial-full")
            .with_max_queue_depth(1);
        let queue = SerialQueue::from_config(&config).unwrap();

        // Park the worker so the channel fills up.
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        queue
            .run_now(move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        queue.run_now(|| {}).unwrap();
        let err = queue.run_now(|| {}).unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull(_)));
        assert_eq!(queue.stats().rejected, 1);

        release_tx.send(()).unwrap();
        queue.shutdown();
    }
}
