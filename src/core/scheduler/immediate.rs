//! Scheduler that runs everything on the caller's own stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::core::{CancelToken, SchedulerError, TokenStatus};

use super::timer::{next_tick_index, tick_instant};
use super::{check_interval, run_guarded, RepeatingWork, Scheduler, SchedulerCounters, SchedulerStats, Work};

/// Strictly synchronous scheduler.
///
/// * `schedule_now` returns only after the work completed.
/// * `schedule_after` blocks the caller until the fire time, then runs the
///   work inline. Another thread may cancel the token, or shut the scheduler
///   down, while the caller is blocked.
/// * `schedule_repeating` runs ticks inline and returns once the recurrence is
///   cancelled, either from inside a tick or by [`Scheduler::shutdown`].
pub struct ImmediateScheduler {
    label: String,
    closed: AtomicBool,
    counters: SchedulerCounters,
    /// Tokens of calls currently blocked in this scheduler.
    waiting: Mutex<Vec<CancelToken>>,
}

impl ImmediateScheduler {
    /// Create an immediate scheduler.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            closed: AtomicBool::new(false),
            counters: SchedulerCounters::default(),
            waiting: Mutex::new(Vec::new()),
        }
    }

    fn ensure_open(&self) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::SchedulerClosed(self.label.clone()));
        }
        Ok(())
    }

    fn track(&self, token: &CancelToken) {
        let mut waiting = self.waiting.lock();
        waiting.retain(|t| t.status() == TokenStatus::Pending);
        waiting.push(token.clone());
    }

    fn untrack(&self, token: &CancelToken) {
        self.waiting.lock().retain(|t| t != token);
    }

    fn run<F: FnOnce()>(&self, work: F) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        run_guarded(&self.label, work, &self.counters);
    }
}

impl Default for ImmediateScheduler {
    fn default() -> Self {
        Self::new("immediate")
    }
}

impl Scheduler for ImmediateScheduler {
    fn label(&self) -> &str {
        &self.label
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule_now(&self, work: Work) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        self.run(work);
        Ok(())
    }

    fn schedule_after(
        &self,
        delay: Duration,
        _tolerance: Duration,
        work: Work,
    ) -> Result<CancelToken, SchedulerError> {
        self.ensure_open()?;
        let token = CancelToken::new();
        self.track(&token);

        let fire_at = Instant::now() + delay;
        if !token.wait_cancelled_until(fire_at) && token.try_fire() {
            self.run(work);
        } else {
            debug!(label = %self.label, token = %token.id(), "delayed work cancelled while waiting");
        }
        self.untrack(&token);
        Ok(token)
    }

    fn schedule_repeating(
        &self,
        interval: Duration,
        mut work: RepeatingWork,
    ) -> Result<CancelToken, SchedulerError> {
        self.ensure_open()?;
        check_interval(interval)?;
        let token = CancelToken::new();
        self.track(&token);

        let start = Instant::now();
        let mut index = 1;
        loop {
            let fire_at = tick_instant(start, interval, index);
            if token.wait_cancelled_until(fire_at) {
                break;
            }
            self.run(|| work(&token));
            index = next_tick_index(start, interval, index, Instant::now());
        }
        self.untrack(&token);
        Ok(token)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiting = std::mem::take(&mut *self.waiting.lock());
        let cancelled = waiting.iter().filter(|t| t.cancel()).count();
        debug!(label = %self.label, cancelled, "immediate scheduler shut down");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> SchedulerStats {
        self.counters.snapshot(self.waiting.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SchedulerExt;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_schedule_now_is_synchronous() {
        let scheduler = ImmediateScheduler::default();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let hits = Arc::clone(&hits);
            scheduler
                .run_now(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(scheduler.stats().completed, 5);
    }

    #[test]
    fn test_schedule_after_blocks_until_due() {
        let scheduler = ImmediateScheduler::default();
        let started = Instant::now();
        let token = scheduler.run_after(Duration::from_millis(30), || {}).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(token.is_fired());
    }

    #[test]
    fn test_repeating_stops_when_tick_cancels() {
        let scheduler = ImmediateScheduler::default();
        let mut ticks = 0;
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let token = scheduler
            .run_every(Duration::from_millis(5), move |token| {
                ticks += 1;
                c.store(ticks, Ordering::SeqCst);
                if ticks == 3 {
                    token.cancel();
                }
            })
            .unwrap();
        assert!(token.is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_shutdown_releases_blocked_caller() {
        let scheduler = Arc::new(ImmediateScheduler::default());
        let remote = Arc::clone(&scheduler);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.shutdown();
        });

        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let token = scheduler
            .run_after(Duration::from_secs(60), move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        stopper.join().unwrap();

        assert!(token.is_cancelled());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(matches!(
            scheduler.run_now(|| {}),
            Err(SchedulerError::SchedulerClosed(_))
        ));
    }
}
