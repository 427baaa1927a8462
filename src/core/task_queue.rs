//! Bounded-concurrency queue of [`AsyncTask`]s.
//!
//! Pending tasks are held in a priority heap: highest priority first, FIFO
//! among equals. Whenever a slot frees up the queue promotes the next task to
//! `Executing` and hands its body to the backing scheduler. The queue learns
//! about completions through a [`TaskObserver`] it registers on each task.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::async_task::TaskId;
use crate::core::{AsyncTask, Scheduler, SchedulerError, TaskContext, TaskObserver, TaskState};
use crate::util::now_ms;

/// Heap entry ordered by priority (highest first) and FIFO within a priority.
struct PendingTask {
    seq: u64,
    task: AsyncTask,
}

impl PendingTask {
    fn key(&self) -> (crate::core::Priority, Reverse<u64>) {
        (self.task.priority(), Reverse(self.seq))
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskQueueStats {
    /// Queue label.
    pub label: String,
    /// Configured concurrency limit.
    pub max_concurrency: usize,
    /// Tasks currently holding a slot.
    pub running: usize,
    /// Tasks waiting for a slot.
    pub pending: usize,
    /// Highest `running` ever observed.
    pub peak_running: usize,
    /// Tasks accepted by `enqueue`.
    pub enqueued: u64,
    /// Tasks promoted to a slot.
    pub started: u64,
    /// Tasks that reached `Finished` while owned by the queue.
    pub finished: u64,
}

struct QueueState {
    pending: BinaryHeap<PendingTask>,
    running: HashMap<TaskId, AsyncTask>,
    max_concurrency: usize,
    next_seq: u64,
    peak_running: usize,
    enqueued: u64,
    started: u64,
    finished: u64,
    /// Threads currently inside [`TaskQueue::drain`].
    drainers: Vec<ThreadId>,
}

impl QueueState {
    fn holds(&self, task: &AsyncTask) -> bool {
        self.running.contains_key(&task.id()) || self.pending.iter().any(|p| p.task == *task)
    }

    /// Reserve slots for as many pending tasks as capacity allows.
    fn promote(&mut self) -> Vec<AsyncTask> {
        let mut batch = Vec::new();
        while self.running.len() < self.max_concurrency {
            let Some(next) = self.pending.pop() else { break };
            self.running.insert(next.task.id(), next.task.clone());
            self.started += 1;
            batch.push(next.task);
        }
        self.peak_running = self.peak_running.max(self.running.len());
        batch
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }

    /// Claim draining for the calling thread. `None` means an outer frame on
    /// this thread is already draining and will pick up any freed slots.
    fn claim_drain(&mut self) -> Option<Vec<AsyncTask>> {
        let me = thread::current().id();
        if self.drainers.contains(&me) {
            return None;
        }
        self.drainers.push(me);
        Some(self.promote())
    }
}

/// Releases the calling thread's drain claim, also when a task body unwinds.
struct DrainClaim<'a> {
    inner: &'a QueueInner,
}

impl Drop for DrainClaim<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        self.inner.state.lock().drainers.retain(|t| *t != me);
    }
}

struct QueueInner {
    label: String,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<QueueState>,
    idle: Condvar,
}

struct QueueObserver {
    queue: Weak<QueueInner>,
}

impl TaskObserver for QueueObserver {
    fn on_transition(&self, task: &AsyncTask, _from: TaskState, to: TaskState) {
        if to != TaskState::Finished {
            return;
        }
        if let Some(inner) = self.queue.upgrade() {
            TaskQueue { inner }.on_task_finished(task);
        }
    }
}

/// Runs at most `max_concurrency` tasks at once on a scheduler.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create a queue running task bodies on `scheduler`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `max_concurrency` is zero.
    pub fn new(
        label: impl Into<String>,
        max_concurrency: usize,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, SchedulerError> {
        if max_concurrency == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        let label = label.into();
        info!(label = %label, max_concurrency, scheduler = %scheduler.label(), "task queue created");
        Ok(Self {
            inner: Arc::new(QueueInner {
                label,
                scheduler,
                state: Mutex::new(QueueState {
                    pending: BinaryHeap::new(),
                    running: HashMap::new(),
                    max_concurrency,
                    next_seq: 0,
                    peak_running: 0,
                    enqueued: 0,
                    started: 0,
                    finished: 0,
                    drainers: Vec::new(),
                }),
                idle: Condvar::new(),
            }),
        })
    }

    /// Queue label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Scheduler the task bodies run on.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    /// Add a `Ready` task. If a slot is free the task is moved to `Executing`
    /// and handed to the scheduler before this returns.
    ///
    /// Called from inside a task body running inline on the same queue, the
    /// task is only queued; the outer drain starts it.
    ///
    /// # Errors
    ///
    /// - `SchedulerClosed` if the backing scheduler was shut down.
    /// - `InvalidTransition` if the task is not `Ready` or is already queued.
    /// - Whatever the scheduler returned if it rejected this task's body. The
    ///   task is then `Finished` with a `Failed` outcome.
    pub fn enqueue(&self, task: &AsyncTask) -> Result<(), SchedulerError> {
        if self.inner.scheduler.is_closed() {
            return Err(SchedulerError::SchedulerClosed(
                self.inner.scheduler.label().to_string(),
            ));
        }

        let batch = {
            let mut state = self.inner.state.lock();
            if state.holds(task) {
                return Err(SchedulerError::InvalidTransition {
                    from: TaskState::Ready,
                    to: TaskState::Ready,
                });
            }
            // Registered before the state check so a racing cancel is observed.
            task.add_observer(Arc::new(QueueObserver {
                queue: Arc::downgrade(&self.inner),
            }));
            let current = task.state();
            if current != TaskState::Ready {
                return Err(SchedulerError::InvalidTransition {
                    from: current,
                    to: TaskState::Executing,
                });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.enqueued += 1;
            state.pending.push(PendingTask {
                seq,
                task: task.clone(),
            });
            debug!(
                label = %self.inner.label,
                task_id = task.id(),
                priority = task.priority().0,
                "task enqueued"
            );
            state.claim_drain()
        };

        match batch {
            Some(batch) => self.drain(batch, Some(task.id())),
            None => Ok(()),
        }
    }

    /// Cancel every task not yet finished.
    ///
    /// Pending tasks finish immediately; running tasks are only flagged.
    pub fn cancel_all(&self) {
        let tasks: Vec<AsyncTask> = {
            let state = self.inner.state.lock();
            state
                .running
                .values()
                .cloned()
                .chain(state.pending.iter().map(|p| p.task.clone()))
                .collect()
        };
        info!(label = %self.inner.label, count = tasks.len(), "cancelling all tasks");
        for task in tasks {
            task.cancel();
        }
    }

    /// Change the concurrency limit. Growing it starts pending tasks right away;
    /// shrinking it lets running tasks finish.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `max_concurrency` is zero.
    pub fn set_max_concurrency(&self, max_concurrency: usize) -> Result<(), SchedulerError> {
        if max_concurrency == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        let batch = {
            let mut state = self.inner.state.lock();
            state.max_concurrency = max_concurrency;
            state.claim_drain()
        };
        if let Some(batch) = batch {
            // Failures of promoted tasks are reported through their outcome.
            let _ = self.drain(batch, None);
        }
        Ok(())
    }

    /// Block until no task is pending or running, or `timeout` elapses.
    /// Returns whether the queue drained.
    #[must_use]
    pub fn wait_until_all_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.is_idle() {
            if self.inner.idle.wait_until(&mut state, deadline).timed_out() {
                return state.is_idle();
            }
        }
        true
    }

    /// Tasks currently holding a slot.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running.len()
    }

    /// Tasks waiting for a slot.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Snapshot of the queue counters.
    #[must_use]
    pub fn stats(&self) -> TaskQueueStats {
        let state = self.inner.state.lock();
        TaskQueueStats {
            label: self.inner.label.clone(),
            max_concurrency: state.max_concurrency,
            running: state.running.len(),
            pending: state.pending.len(),
            peak_running: state.peak_running,
            enqueued: state.enqueued,
            started: state.started,
            finished: state.finished,
        }
    }

    fn on_task_finished(&self, task: &AsyncTask) {
        let batch = {
            let mut state = self.inner.state.lock();
            let id = task.id();
            let owned = if state.running.remove(&id).is_some() {
                true
            } else {
                let before = state.pending.len();
                state.pending.retain(|p| p.task.id() != id);
                state.pending.len() != before
            };
            if owned {
                state.finished += 1;
                debug!(
                    label = %self.inner.label,
                    task_id = id,
                    outcome = ?task.outcome(),
                    finished_at_ms = now_ms(),
                    "task finished"
                );
            }
            if state.is_idle() {
                self.inner.idle.notify_all();
            }
            state.claim_drain()
        };
        if let Some(batch) = batch {
            let _ = self.drain(batch, None);
        }
    }

    /// Start `batch`, then keep promoting until no slot or no task is left.
    ///
    /// Completions that happen on this thread while draining (inline
    /// schedulers) only release their slot, so the stack stays flat however
    /// long the backlog is. Returns the dispatch error of `own`, if any.
    fn drain(&self, mut batch: Vec<AsyncTask>, own: Option<TaskId>) -> Result<(), SchedulerError> {
        let _claim = DrainClaim { inner: &self.inner };
        let mut own_result = Ok(());
        while !batch.is_empty() {
            for task in batch {
                if let Err(err) = self.start(&task) {
                    if own == Some(task.id()) {
                        own_result = Err(err);
                    }
                }
            }
            batch = self.inner.state.lock().promote();
        }
        own_result
    }

    /// Move a reserved task to `Executing` and dispatch its body.
    fn start(&self, task: &AsyncTask) -> Result<(), SchedulerError> {
        match task.begin() {
            Ok(true) => self.dispatch(task),
            // Cancelled before starting; the observer already released the slot.
            Ok(false) => Ok(()),
            Err(err) => {
                debug!(label = %self.inner.label, task_id = task.id(), error = %err, "reserved task could not begin");
                self.on_task_finished(task);
                Ok(())
            }
        }
    }

    fn dispatch(&self, task: &AsyncTask) -> Result<(), SchedulerError> {
        let Some(body) = task.take_body() else {
            warn!(label = %self.inner.label, task_id = task.id(), "task has no body");
            self.fail_task(task, "task body already consumed");
            return Ok(());
        };
        let runner = task.clone();
        let result = self.inner.scheduler.schedule_now(Box::new(move || {
            let ctx = TaskContext::new(runner.clone());
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(ctx))) {
                if runner.state() == TaskState::Executing {
                    let _ = runner.fail("task body panicked");
                }
                panic::resume_unwind(payload);
            }
        }));
        if let Err(err) = result {
            warn!(label = %self.inner.label, task_id = task.id(), error = %err, "task dispatch failed");
            self.fail_task(task, err.to_string());
            return Err(err);
        }
        Ok(())
    }

    fn fail_task(&self, task: &AsyncTask, reason: impl Into<String>) {
        if let Err(err) = task.fail(reason) {
            warn!(label = %self.inner.label, task_id = task.id(), error = %err, "could not fail task");
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("label", &self.inner.label)
            .field("stats", &self.stats())
            .finish()
    }
}
