//! Fixed-size worker pool scheduler.

use std::time::{Duration, Instant};

use crate::config::{SchedulerConfig, SchedulerKind};
use crate::core::{CancelToken, SchedulerError};

use super::workers::ThreadedBackend;
use super::{RepeatingWork, Scheduler, SchedulerStats, Work};

/// Runs work on `N` worker threads with no ordering guarantee between items.
///
/// Ticks of one recurrence are still serialized with each other: a tick that
/// lands on a second worker while the previous one is running waits for it.
pub struct BoundedPool {
    backend: ThreadedBackend,
    size: usize,
}

impl BoundedPool {
    /// Create a pool of `size` workers with default depth and stack size.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero size, `Backend` if threads cannot be
    /// spawned.
    pub fn new(label: impl Into<String>, size: usize) -> Result<Self, SchedulerError> {
        Self::from_config(
            &SchedulerConfig::new(SchedulerKind::Pool)
                .with_label(label)
                .with_worker_count(size),
        )
    }

    /// Create a pool from configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if validation fails, `Backend` if threads cannot
    /// be spawned.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        Ok(Self {
            backend: ThreadedBackend::new(config, config.worker_count)?,
            size: config.worker_count,
        })
    }

    /// Number of worker threads, which is also the maximum concurrency.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Scheduler for BoundedPool {
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
