//! Pluggable execution contexts for immediate, delayed and recurring work.
//!
//! Every backend implements the same [`Scheduler`] contract and differs only in
//! *where* work runs:
//!
//! | Backend | Context | Ordering |
//! |---|---|---|
//! | [`ImmediateScheduler`] | caller's stack | synchronous, in order |
//! | [`SerialQueue`] | one dedicated worker thread | FIFO |
//! | [`BoundedPool`] | N worker threads | unordered |
//! | [`CooperativeLoop`] | whoever drives `run_*` | FIFO per iteration |
//!
//! Recurring work is due at `start + k * interval`, measured from the original
//! start. When a driver falls behind by more than one interval the missed ticks
//! are skipped rather than replayed.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tickwork::core::{Scheduler, SchedulerExt, SerialQueue};
//!
//! let queue = SerialQueue::new("demo")?;
//! queue.run_now(|| println!("first"))?;
//! let token = queue.run_after(Duration::from_secs(5), || println!("never"))?;
//! token.cancel();
//! ```

mod cooperative;
mod immediate;
mod pool;
mod serial;
pub(crate) mod timer;
mod workers;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::{CancelToken, SchedulerError};

pub use cooperative::CooperativeLoop;
pub use immediate::ImmediateScheduler;
pub use pool::BoundedPool;
pub use serial::SerialQueue;

/// One-shot unit of work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Recurring unit of work. Receives the recurrence's token so a tick may stop
/// its own recurrence.
pub type RepeatingWork = Box<dyn FnMut(&CancelToken) + Send + 'static>;

/// Execution context that accepts work and runs it under its own policy.
pub trait Scheduler: Send + Sync {
    /// Human-readable name used in logs and errors.
    fn label(&self) -> &str;

    /// Current instant according to this scheduler's clock.
    fn now(&self) -> Instant;

    /// Run `work` according to this scheduler's execution policy.
    ///
    /// # Errors
    ///
    /// `SchedulerClosed` after shutdown, `QueueFull` if the dispatch queue has
    /// no room.
    fn schedule_now(&self, work: Work) -> Result<(), SchedulerError>;

    /// Run `work` no earlier than `delay` from now and at most `tolerance` late.
    ///
    /// # Errors
    ///
    /// `SchedulerClosed` after shutdown.
    fn schedule_after(
        &self,
        delay: Duration,
        tolerance: Duration,
        work: Work,
    ) -> Result<CancelToken, SchedulerError>;

    /// Invoke `work` every `interval` until the returned token is cancelled.
    ///
    /// # Errors
    ///
    /// `SchedulerClosed` after shutdown, `InvalidConfig` for a zero interval.
    fn schedule_repeating(
        &self,
        interval: Duration,
        work: RepeatingWork,
    ) -> Result<CancelToken, SchedulerError>;

    /// Stop accepting work and cancel everything still pending.
    fn shutdown(&self);

    /// Whether [`shutdown`](Self::shutdown) has been called.
    fn is_closed(&self) -> bool;

    /// Snapshot of dispatch counters.
    fn stats(&self) -> SchedulerStats;
}

/// Closure-taking conveniences for any [`Scheduler`].
pub trait SchedulerExt: Scheduler {
    /// [`Scheduler::schedule_now`] with an unboxed closure.
    ///
    /// # Errors
    ///
    /// Same as [`Scheduler::schedule_now`].
    fn run_now<F>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_now(Box::new(f))
    }

    /// [`Scheduler::schedule_after`] with zero tolerance.
    ///
    /// # Errors
    ///
    /// Same as [`Scheduler::schedule_after`].
    fn run_after<F>(&self, delay: Duration, f: F) -> Result<CancelToken, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_after(delay, Duration::ZERO, Box::new(f))
    }

    /// [`Scheduler::schedule_repeating`] with an unboxed closure.
    ///
    /// # Errors
    ///
    /// Same as [`Scheduler::schedule_repeating`].
    fn run_every<F>(&self, interval: Duration, f: F) -> Result<CancelToken, SchedulerError>
    where
        F: FnMut(&CancelToken) + Send + 'static,
    {
        self.schedule_repeating(interval, Box::new(f))
    }
}

impl<S: Scheduler + ?Sized> SchedulerExt for S {}

/// Statistics about scheduler dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Work items accepted (immediate, delayed and individual ticks).
    pub submitted: u64,
    /// Work items that ran to completion.
    pub completed: u64,
    /// Work items that panicked.
    pub panicked: u64,
    /// Work items refused because the dispatch queue was full.
    pub rejected: u64,
    /// Delayed or recurring items currently waiting for their fire time.
    pub pending_timers: usize,
}

/// Internal counters for scheduler statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub panicked: AtomicU64,
    pub rejected: AtomicU64,
}

impl SchedulerCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, pending_timers: usize) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            pending_timers,
        }
    }
}

/// Run one work item, isolating a panic to that item.
pub(crate) fn run_guarded<F: FnOnce()>(label: &str, work: F, counters: &SchedulerCounters) {
    match catch_unwind(AssertUnwindSafe(work)) {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(panic) => {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".into());
            tracing::error!(label, panic = %message, "scheduled work panicked");
        }
    }
}

/// Reject zero intervals, which would spin.
pub(crate) fn check_interval(interval: Duration) -> Result<(), SchedulerError> {
    if interval.is_zero() {
        return Err(SchedulerError::InvalidConfig(
            "repeating interval must be greater than 0".into(),
        ));
    }
    Ok(())
}
