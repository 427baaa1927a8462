//! Scheduler backed by a tokio runtime handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::core::scheduler::{check_interval, run_guarded, SchedulerCounters};
use crate::core::{CancelToken, RepeatingWork, Scheduler, SchedulerError, SchedulerStats, TokenStatus, Work};

struct Inner {
    label: String,
    handle: tokio::runtime::Handle,
    closed: AtomicBool,
    counters: SchedulerCounters,
    /// Tokens of timers that have not resolved yet, cancelled on shutdown.
    pending: Mutex<Vec<CancelToken>>,
}

/// Tokio-based scheduler that runs work as tasks on a runtime.
///
/// Work runs inside async tasks, so it should be short and non-blocking.
/// Recurrences use `tokio::time::interval` with [`MissedTickBehavior::Skip`],
/// which keeps ticks aligned to the original start.
#[derive(Clone)]
pub struct TokioScheduler {
    inner: Arc<Inner>,
}

impl TokioScheduler {
    /// Create a scheduler from a tokio runtime handle.
    pub fn new(label: impl Into<String>, handle: tokio::runtime::Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                handle,
                closed: AtomicBool::new(false),
                counters: SchedulerCounters::default(),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a scheduler on the runtime the caller is running in.
    ///
    /// # Errors
    ///
    /// Returns `Backend` when called outside a tokio runtime.
    pub fn current(label: impl Into<String>) -> Result<Self, SchedulerError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| SchedulerError::Backend(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(label, handle))
    }

    fn ensure_open(&self) -> Result<(), SchedulerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::SchedulerClosed(self.inner.label.clone()));
        }
        Ok(())
    }

    /// Register a token for shutdown and return a notifier woken on cancel.
    fn track(&self, token: &CancelToken) -> Arc<Notify> {
        {
            let mut pending = self.inner.pending.lock();
            pending.retain(|t| t.status() == TokenStatus::Pending);
            pending.push(token.clone());
        }
        let notify = Arc::new(Notify::new());
        let waker = Arc::clone(&notify);
        token.on_cancel(move || waker.notify_one());
        notify
    }
}

impl Scheduler for TokioScheduler {
    fn label(&self) -> &str {
        &self.inner.label
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule_now(&self, work: Work) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            run_guarded(&inner.label, work, &inner.counters);
        });
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
        let cancelled = self.track(&token);
        let deadline = tokio::time::Instant::now() + delay;
        let inner = Arc::clone(&self.inner);
        let claim = token.clone();

        self.inner.handle.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                () = cancelled.notified() => return,
            }
            if claim.try_fire() {
                inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
                run_guarded(&inner.label, work, &inner.counters);
            }
        });
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
        let cancelled = self.track(&token);
        let inner = Arc::clone(&self.inner);
        let tick_token = token.clone();

        self.inner.handle.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if tick_token.is_cancelled() {
                            break;
                        }
                        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
                        run_guarded(&inner.label, || work(&tick_token), &inner.counters);
                    }
                    () = cancelled.notified() => break,
                }
            }
            tracing::debug!(label = %inner.label, token = %tick_token.id(), "recurrence ended");
        });
        Ok(token)
    }

    fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        let cancelled = pending.iter().filter(|t| t.cancel()).count();
        tracing::info!(label = %self.inner.label, cancelled, "tokio scheduler shut down");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> SchedulerStats {
        let pending = self
            .inner
            .pending
            .lock()
            .iter()
            .filter(|t| t.status() == TokenStatus::Pending)
            .count();
        self.inner.counters.snapshot(pending)
    }
}
