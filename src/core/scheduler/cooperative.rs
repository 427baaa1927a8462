//! Run-loop style scheduler driven explicitly by its owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::{CancelToken, SchedulerError};
use crate::util::clock::{Clock, MonotonicClock};

use super::timer::TimerHeap;
use super::{check_interval, run_guarded, RepeatingWork, Scheduler, SchedulerCounters, SchedulerStats, Work};

enum LoopMessage {
    Run(Work),
    Wake,
}

/// Cooperative scheduler: nothing runs until someone drives the loop.
///
/// Any thread may schedule work; it is handed into the loop through a
/// channel. Work only executes inside [`run_once`](Self::run_once),
/// [`run_until`](Self::run_until) or [`run_until_idle`](Self::run_until_idle),
/// on the thread that calls them, and only one caller may drive at a time.
///
/// Each iteration first runs the immediate work that was queued when the
/// iteration began, in FIFO order, then every timer that is due.
pub struct CooperativeLoop {
    label: String,
    clock: Arc<dyn Clock>,
    inbox_tx: Sender<LoopMessage>,
    inbox_rx: Receiver<LoopMessage>,
    timers: Arc<Mutex<TimerHeap>>,
    driving: AtomicBool,
    stop_requested: AtomicBool,
    closed: AtomicBool,
    counters: SchedulerCounters,
}

/// Releases the single-driver flag when a `run_*` call returns.
struct DriveGuard<'a>(&'a AtomicBool);

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CooperativeLoop {
    /// Create a loop on the monotonic clock.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_clock(label, Arc::new(MonotonicClock))
    }

    /// Create a loop reading time from `clock`.
    ///
    /// With a [`ManualClock`](crate::util::ManualClock), drive the loop with
    /// [`run_once`](Self::run_once) or [`run_until_idle`](Self::run_until_idle)
    /// after advancing the clock.
    #[must_use]
    pub fn with_clock(label: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        Self {
            label: label.into(),
            clock,
            inbox_tx,
            inbox_rx,
            timers: Arc::new(Mutex::new(TimerHeap::new())),
            driving: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters: SchedulerCounters::default(),
        }
    }

    fn ensure_open(&self) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::SchedulerClosed(self.label.clone()));
        }
        Ok(())
    }

    fn drive(&self) -> Result<DriveGuard<'_>, SchedulerError> {
        self.ensure_open()?;
        if self.driving.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::LoopBusy);
        }
        Ok(DriveGuard(&self.driving))
    }

    fn run(&self, work: Work) {
        run_guarded(&self.label, work, &self.counters);
    }

    /// One iteration: queued immediate work, then due timers.
    fn iterate(&self) -> usize {
        let mut ran = 0;
        let queued = self.inbox_rx.len();
        for _ in 0..queued {
            match self.inbox_rx.try_recv() {
                Ok(LoopMessage::Run(work)) => {
                    self.run(work);
                    ran += 1;
                }
                Ok(LoopMessage::Wake) => {}
                Err(_) => break,
            }
        }

        let due = self.timers.lock().take_due(self.clock.now());
        for item in due {
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            self.run(item.work);
            ran += 1;
        }
        ran
    }

    /// Run a single iteration without waiting. Returns how many items ran.
    ///
    /// # Errors
    ///
    /// `LoopBusy` if another caller is driving, `SchedulerClosed` after shutdown.
    pub fn run_once(&self) -> Result<usize, SchedulerError> {
        let _guard = self.drive()?;
        Ok(self.iterate())
    }

    /// Iterate until nothing is runnable right now. Future timers are left
    /// pending. Returns how many items ran.
    ///
    /// # Errors
    ///
    /// `LoopBusy` if another caller is driving, `SchedulerClosed` after shutdown.
    pub fn run_until_idle(&self) -> Result<usize, SchedulerError> {
        let _guard = self.drive()?;
        let mut total = 0;
        loop {
            let ran = self.iterate();
            if ran == 0 {
                return Ok(total);
            }
            total += ran;
        }
    }

    /// Keep iterating, sleeping between timers, until `deadline` passes,
    /// [`stop`](Self::stop) is called or the loop is shut down.
    ///
    /// # Errors
    ///
    /// `LoopBusy` if another caller is driving, `SchedulerClosed` if the loop
    /// was already shut down.
    pub fn run_until(&self, deadline: Instant) -> Result<usize, SchedulerError> {
        let _guard = self.drive()?;
        // A stop requested while nobody was driving does not carry over.
        self.stop_requested.store(false, Ordering::Release);
        debug!(label = %self.label, "loop running");
        let mut total = 0;
        loop {
            if self.stop_requested.swap(false, Ordering::AcqRel) || self.closed.load(Ordering::Acquire) {
                break;
            }
            total += self.iterate();

            let now = self.clock.now();
            if now >= deadline {
                break;
            }
            let wake_at = self
                .timers
                .lock()
                .next_deadline()
                .map_or(deadline, |next| next.min(deadline));
            let wait = wake_at.saturating_duration_since(now);

            match self.inbox_rx.recv_timeout(wait) {
                Ok(LoopMessage::Run(work)) => {
                    self.run(work);
                    total += 1;
                }
                Ok(LoopMessage::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(label = %self.label, ran = total, "loop returned");
        Ok(total)
    }

    /// Ask the current [`run_until`](Self::run_until) call to return.
    ///
    /// Has no effect on later calls: a stop issued while no `run_until` is in
    /// progress is discarded when the next one starts.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let _ = self.inbox_tx.send(LoopMessage::Wake);
    }

    /// Earliest pending timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.lock().next_deadline()
    }

    /// Immediate work waiting for the next iteration.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inbox_rx.len()
    }

    /// Wake the driver for a new timer and purge the entry if it is cancelled.
    fn watch(&self, token: &CancelToken) {
        let _ = self.inbox_tx.send(LoopMessage::Wake);
        let timers: Weak<Mutex<TimerHeap>> = Arc::downgrade(&self.timers);
        token.on_cancel(move || {
            if let Some(timers) = timers.upgrade() {
                timers.lock().prune();
            }
        });
    }
}

impl Scheduler for CooperativeLoop {
    fn label(&self) -> &str {
        &self.label
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn schedule_now(&self, work: Work) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        self.inbox_tx
            .send(LoopMessage::Run(work))
            .map_err(|_| SchedulerError::SchedulerClosed(self.label.clone()))?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn schedule_after(
        &self,
        delay: Duration,
        tolerance: Duration,
        work: Work,
    ) -> Result<CancelToken, SchedulerError> {
        self.ensure_open()?;
        let token = self
            .timers
            .lock()
            .schedule_once(self.clock.now(), delay, tolerance, work);
        self.watch(&token);
        Ok(token)
    }

    fn schedule_repeating(
        &self,
        interval: Duration,
        work: RepeatingWork,
    ) -> Result<CancelToken, SchedulerError> {
        self.ensure_open()?;
        check_interval(interval)?;
        let token = self
            .timers
            .lock()
            .schedule_repeating(self.clock.now(), interval, work);
        self.watch(&token);
        Ok(token)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tokens = self.timers.lock().drain_tokens();
        let cancelled = tokens.iter().filter(|t| t.cancel()).count();

        let mut abandoned = 0;
        while let Ok(message) = self.inbox_rx.try_recv() {
            if matches!(message, LoopMessage::Run(_)) {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(label = %self.label, abandoned, "loop shut down with queued work");
        }
        debug!(label = %self.label, cancelled, "loop shut down");
        let _ = self.inbox_tx.send(LoopMessage::Wake);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> SchedulerStats {
        self.counters.snapshot(self.timers.lock().len())
    }
}
