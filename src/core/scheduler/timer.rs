//! Pending set of delayed and recurring items, plus the thread that drives it.
//!
//! Entries are ordered by the latest instant they may fire (`fire_at +
//! tolerance`). When that instant arrives, every entry whose `fire_at` has
//! already passed fires with it, which coalesces nearby timers into one wakeup.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::core::{CancelToken, SchedulerError};

use super::{RepeatingWork, Work};

/// What happens when an entry comes due.
pub(crate) enum TimerAction {
    /// Fire once, then forget.
    Once(Work),
    /// Fire tick `index`, then re-arm for the next tick after `now`.
    Repeating {
        work: Arc<Mutex<RepeatingWork>>,
        start: Instant,
        interval: Duration,
        index: u64,
    },
}

struct TimerEntry {
    deadline: Instant,
    fire_at: Instant,
    seq: u64,
    token: CancelToken,
    action: TimerAction,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest deadline first, then insertion order (reversed for max-heap).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// An entry that came due, ready to hand to an execution context.
pub(crate) struct DueItem {
    pub token: CancelToken,
    pub work: Work,
    pub recurring: bool,
}

/// Ordered pending set without any thread of its own.
#[derive(Default)]
pub(crate) struct TimerHeap {
    entries: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, fire_at: Instant, tolerance: Duration, token: CancelToken, action: TimerAction) {
        self.seq += 1;
        self.entries.push(TimerEntry {
            deadline: fire_at + tolerance,
            fire_at,
            seq: self.seq,
            token,
            action,
        });
    }

    /// Add a one-shot item due `delay` after `now`.
    pub fn schedule_once(
        &mut self,
        now: Instant,
        delay: Duration,
        tolerance: Duration,
        work: Work,
    ) -> CancelToken {
        let token = CancelToken::new();
        self.push(now + delay, tolerance, token.clone(), TimerAction::Once(work));
        token
    }

    /// Add a recurrence whose first tick is due one `interval` after `now`.
    pub fn schedule_repeating(
        &mut self,
        now: Instant,
        interval: Duration,
        work: RepeatingWork,
    ) -> CancelToken {
        let token = CancelToken::new();
        let action = TimerAction::Repeating {
            work: Arc::new(Mutex::new(work)),
            start: now,
            interval,
            index: 1,
        };
        self.push(now + interval, Duration::ZERO, token.clone(), action);
        token
    }

    /// Earliest instant at which something must fire, dropping cancelled heads.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(head) = self.entries.peek() {
            if head.token.is_cancelled() {
                self.entries.pop();
            } else {
                return Some(head.deadline);
            }
        }
        None
    }

    /// Remove and return everything that should fire at `now`.
    ///
    /// Recurrences are re-armed before returning. One-shot work is wrapped so
    /// that it claims its token on the executing thread and is suppressed if the
    /// token was cancelled in the meantime.
    pub fn take_due(&mut self, now: Instant) -> Vec<DueItem> {
        match self.next_deadline() {
            Some(deadline) if deadline <= now => {}
            _ => return Vec::new(),
        }

        let mut fired = Vec::new();
        let mut keep = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain() {
            if entry.token.is_cancelled() {
                continue;
            }
            if entry.fire_at <= now {
                fired.push(entry);
            } else {
                keep.push(entry);
            }
        }
        self.entries.extend(keep);
        fired.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.seq.cmp(&b.seq)));

        let mut due = Vec::with_capacity(fired.len());
        for entry in fired {
            let token = entry.token;
            match entry.action {
                TimerAction::Once(work) => {
                    let claim = token.clone();
                    due.push(DueItem {
                        token,
                        work: Box::new(move || {
                            if claim.try_fire() {
                                work();
                            }
                        }),
                        recurring: false,
                    });
                }
                TimerAction::Repeating {
                    work,
                    start,
                    interval,
                    index,
                } => {
                    let next = next_tick_index(start, interval, index, now);
                    let fire_at = tick_instant(start, interval, next);
                    self.push(
                        fire_at,
                        Duration::ZERO,
                        token.clone(),
                        TimerAction::Repeating {
                            work: Arc::clone(&work),
                            start,
                            interval,
                            index: next,
                        },
                    );

                    let tick_token = token.clone();
                    due.push(DueItem {
                        token,
                        work: Box::new(move || {
                            // Checked under the lock so a tick queued behind the
                            // one that cancelled stays silent.
                            let mut work = work.lock();
                            if !tick_token.is_cancelled() {
                                (*work)(&tick_token);
                            }
                        }),
                        recurring: true,
                    });
                }
            }
        }
        due
    }

    /// Drop cancelled entries anywhere in the heap.
    pub fn prune(&mut self) {
        self.entries.retain(|e| !e.token.is_cancelled());
    }

    /// Empty the heap, returning the tokens so the caller can cancel them
    /// outside any lock.
    pub fn drain_tokens(&mut self) -> Vec<CancelToken> {
        self.entries.drain().map(|e| e.token).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// First tick index after `index` whose due time is still ahead of `now`.
///
/// Ticks that were missed entirely are skipped rather than replayed.
pub(crate) fn next_tick_index(start: Instant, interval: Duration, index: u64, now: Instant) -> u64 {
    let elapsed = now.saturating_duration_since(start).as_nanos();
    let behind = u64::try_from(elapsed / interval.as_nanos().max(1)).unwrap_or(u64::MAX);
    behind.saturating_add(1).max(index.saturating_add(1))
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Stand-in deadline for ticks too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Due instant of tick `index`, measured from the original start.
pub(crate) fn tick_instant(start: Instant, interval: Duration, index: u64) -> Instant {
    let nanos = interval.as_nanos().saturating_mul(u128::from(index));
    let offset = u64::try_from(nanos / NANOS_PER_SEC).ok().and_then(|secs| {
        u32::try_from(nanos % NANOS_PER_SEC)
            .ok()
            .map(|subsec| Duration::new(secs, subsec))
    });
    offset
        .and_then(|offset| start.checked_add(offset))
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Hands fired work to an execution context.
pub(crate) type Dispatch = Arc<dyn Fn(Work) -> Result<(), SchedulerError> + Send + Sync>;

struct TimerState {
    heap: TimerHeap,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Dedicated thread that sleeps until the next deadline and dispatches due work.
pub(crate) struct TimerThread {
    label: String,
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub fn spawn(label: &str, dispatch: Dispatch) -> Result<Self, SchedulerError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: TimerHeap::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_label = label.to_string();
        let handle = thread::Builder::new()
            .name(format!("{label}-timer"))
            .spawn(move || timer_loop(&thread_label, &thread_shared, &dispatch))
            .map_err(|e| SchedulerError::Backend(format!("failed to spawn timer thread: {e}")))?;

        Ok(Self {
            label: label.to_string(),
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn schedule_once(
        &self,
        delay: Duration,
        tolerance: Duration,
        work: Work,
    ) -> Result<CancelToken, SchedulerError> {
        let token = {
            let mut state = self.open_state()?;
            state.heap.schedule_once(Instant::now(), delay, tolerance, work)
        };
        self.watch(&token);
        Ok(token)
    }

    pub fn schedule_repeating(
        &self,
        interval: Duration,
        work: RepeatingWork,
    ) -> Result<CancelToken, SchedulerError> {
        let token = {
            let mut state = self.open_state()?;
            state.heap.schedule_repeating(Instant::now(), interval, work)
        };
        self.watch(&token);
        Ok(token)
    }

    fn open_state(&self) -> Result<MutexGuard<'_, TimerState>, SchedulerError> {
        let state = self.shared.state.lock();
        if state.shutdown {
            return Err(SchedulerError::SchedulerClosed(self.label.clone()));
        }
        Ok(state)
    }

    /// Wake the timer thread for the new entry, and purge it again if the token
    /// is cancelled before firing.
    fn watch(&self, token: &CancelToken) {
        self.shared.wake.notify_one();
        let shared: Weak<TimerShared> = Arc::downgrade(&self.shared);
        token.on_cancel(move || {
            if let Some(shared) = shared.upgrade() {
                shared.state.lock().heap.prune();
                shared.wake.notify_one();
            }
        });
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Cancel every pending entry and stop the thread.
    pub fn shutdown(&self) {
        let tokens = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.heap.drain_tokens()
        };
        self.shared.wake.notify_all();

        let cancelled = tokens.iter().filter(|t| t.cancel()).count();
        debug!(label = %self.label, cancelled, "timer thread shutting down");

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(label = %self.label, "timer thread panicked");
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(label: &str, shared: &TimerShared, dispatch: &Dispatch) {
    debug!(label, "timer thread started");
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        match state.heap.next_deadline() {
            None => shared.wake.wait(&mut state),
            Some(deadline) if deadline > now => {
                shared.wake.wait_until(&mut state, deadline);
            }
            Some(_) => {
                let due = state.heap.take_due(now);
                MutexGuard::unlocked(&mut state, || {
                    for item in due {
                        if let Err(err) = dispatch(item.work) {
                            if item.recurring {
                                warn!(label, token = %item.token.id(), error = %err, "tick dropped");
                            } else {
                                error!(label, token = %item.token.id(), error = %err, "timer dispatch failed");
                                item.token.cancel();
                            }
                        }
                    }
                });
            }
        }
    }
    debug!(label, "timer thread exiting");
}
