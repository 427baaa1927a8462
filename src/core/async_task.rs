//! Units of work with an explicit, observable life-cycle.
//!
//! ```text
//!            begin()             finish() / fail()
//!   Ready ─────────────▶ Executing ─────────────────▶ Finished
//!     │                                                   ▲
//!     └──────────────── cancel() ─────────────────────────┘
//! ```
//!
//! Only the owning [`TaskQueue`](crate::core::TaskQueue) moves a task out of
//! `Ready`. Once `Executing`, cancellation is cooperative: the flag is set and
//! the body is expected to notice it and finish. `Finished` is absorbing; any
//! further transition is rejected with `InvalidTransition`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{CancelToken, Scheduler, SchedulerError};

/// Identifier assigned to every task at construction.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Life-cycle state of an [`AsyncTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be started by its queue.
    Ready,
    /// Started; the body owns completion.
    Executing,
    /// Terminal.
    Finished,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Executing => write!(f, "executing"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Queue priority. Higher runs first; equal priorities run in insertion order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    /// Lowest named level.
    pub const VERY_LOW: Self = Self(-8);
    /// Below normal.
    pub const LOW: Self = Self(-4);
    /// Default level.
    pub const NORMAL: Self = Self(0);
    /// Above normal.
    pub const HIGH: Self = Self(4);
    /// Highest named level.
    pub const VERY_HIGH: Self = Self(8);
}

/// How a finished task ended, reported out-of-band from its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// The body finished normally.
    Succeeded,
    /// The body reported a failure.
    Failed(String),
    /// The task was cancelled, before or during execution.
    Cancelled,
}

/// Receives every state transition of the tasks it is registered on.
///
/// Called synchronously on the thread performing the transition, after the
/// state changed and before the transition call returns. The task's own locks
/// are released at that point.
pub trait TaskObserver: Send + Sync {
    /// `task` moved from `from` to `to`.
    fn on_transition(&self, task: &AsyncTask, from: TaskState, to: TaskState);
}

impl<F> TaskObserver for F
where
    F: Fn(&AsyncTask, TaskState, TaskState) + Send + Sync,
{
    fn on_transition(&self, task: &AsyncTask, from: TaskState, to: TaskState) {
        self(task, from, to);
    }
}

type TaskBody = Box<dyn FnOnce(TaskContext) + Send + 'static>;
type CompletionCallback = Box<dyn FnOnce(&AsyncTask) + Send + 'static>;

struct TaskCore {
    state: TaskState,
    outcome: Option<TaskOutcome>,
}

struct TaskInner {
    id: TaskId,
    name: String,
    priority: Priority,
    created_at: Instant,
    cancelled: AtomicBool,
    core: Mutex<TaskCore>,
    finished: Condvar,
    observers: Mutex<Vec<Arc<dyn TaskObserver>>>,
    body: Mutex<Option<TaskBody>>,
    completions: Mutex<Vec<CompletionCallback>>,
}

/// Shared handle to a task. Clones refer to the same task.
#[derive(Clone)]
pub struct AsyncTask {
    inner: Arc<TaskInner>,
}

impl AsyncTask {
    /// Create a task whose body completes asynchronously.
    ///
    /// The body receives a [`TaskContext`] and must eventually call
    /// [`TaskContext::finish`] or [`TaskContext::fail`], possibly from another
    /// thread, or the task stays `Executing` and keeps its queue slot.
    pub fn new<F>(name: impl Into<String>, priority: Priority, body: F) -> Self
    where
        F: FnOnce(TaskContext) + Send + 'static,
    {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                priority,
                created_at: Instant::now(),
                cancelled: AtomicBool::new(false),
                core: Mutex::new(TaskCore {
                    state: TaskState::Ready,
                    outcome: None,
                }),
                finished: Condvar::new(),
                observers: Mutex::new(Vec::new()),
                body: Mutex::new(Some(Box::new(body))),
                completions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a task from a synchronous body that finishes when it returns.
    ///
    /// A body that is cancelled before it gets to run is skipped.
    pub fn from_fn<F>(name: impl Into<String>, priority: Priority, f: F) -> Self
    where
        F: FnOnce(&TaskContext) -> Result<(), String> + Send + 'static,
    {
        Self::new(name, priority, move |ctx: TaskContext| {
            if ctx.is_cancelled() {
                let _ = ctx.finish();
                return;
            }
            let result = f(&ctx);
            if ctx.task().state() != TaskState::Executing {
                return;
            }
            let _ = match result {
                Ok(()) => ctx.finish(),
                Err(reason) => ctx.fail(reason),
            };
        })
    }

    /// Task identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Task name, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    /// When the task was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.core.lock().state
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Whether the task reached `Finished`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Outcome, once finished.
    #[must_use]
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.inner.core.lock().outcome.clone()
    }

    /// Register an observer for subsequent transitions.
    pub fn add_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.inner.observers.lock().push(observer);
    }

    /// Run `f` once the task finishes, or right away if it already has.
    pub fn on_completion<F>(&self, f: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        {
            let core = self.inner.core.lock();
            if core.state != TaskState::Finished {
                self.inner.completions.lock().push(Box::new(f));
                return;
            }
        }
        f(self);
    }

    /// Request cancellation.
    ///
    /// A `Ready` task moves straight to `Finished`. An `Executing` task is only
    /// flagged; its body must notice and finish. A finished task is unaffected.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(task_id = self.id(), name = %self.name(), "task cancellation requested");
        // Losing the race to begin() is fine: the flag is already set.
        let _ = self.transition(TaskState::Ready, TaskState::Finished, Some(TaskOutcome::Cancelled), false);
    }

    /// Move `Executing → Finished`.
    ///
    /// The outcome is `Cancelled` if cancellation was requested, otherwise
    /// `Succeeded`.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the task is not executing, including a second
    /// call to `finish`.
    pub fn finish(&self) -> Result<(), SchedulerError> {
        let outcome = if self.is_cancelled() {
            TaskOutcome::Cancelled
        } else {
            TaskOutcome::Succeeded
        };
        self.transition(TaskState::Executing, TaskState::Finished, Some(outcome), true)
    }

    /// Move `Executing → Finished` with a failure outcome.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the task is not executing.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), SchedulerError> {
        self.transition(
            TaskState::Executing,
            TaskState::Finished,
            Some(TaskOutcome::Failed(reason.into())),
            true,
        )
    }

    /// Move `Ready → Executing`. Only the owning queue calls this.
    ///
    /// Returns `Ok(false)` if the task had been flagged cancelled, in which
    /// case it goes to `Finished` without executing.
    pub(crate) fn begin(&self) -> Result<bool, SchedulerError> {
        if self.is_cancelled() {
            self.transition(TaskState::Ready, TaskState::Finished, Some(TaskOutcome::Cancelled), false)?;
            return Ok(false);
        }
        self.transition(TaskState::Ready, TaskState::Executing, None, false)?;
        Ok(true)
    }

    /// Hand the body to the executing context.
    pub(crate) fn take_body(&self) -> Option<Box<dyn FnOnce(TaskContext) + Send + 'static>> {
        self.inner.body.lock().take()
    }

    fn transition(
        &self,
        expected: TaskState,
        to: TaskState,
        outcome: Option<TaskOutcome>,
        report: bool,
    ) -> Result<(), SchedulerError> {
        {
            let mut core = self.inner.core.lock();
            if core.state != expected {
                let err = SchedulerError::InvalidTransition {
                    from: core.state,
                    to,
                };
                drop(core);
                if report {
                    warn!(task_id = self.id(), name = %self.name(), error = %err, "rejected task transition");
                }
                return Err(err);
            }
            core.state = to;
            if to == TaskState::Finished {
                core.outcome = outcome;
            }
        }
        debug!(task_id = self.id(), from = %expected, to = %to, "task transition");

        if to == TaskState::Finished {
            self.inner.finished.notify_all();
            // The body can no longer run; drop whatever it captured.
            self.inner.body.lock().take();
        }

        let observers = self.inner.observers.lock().clone();
        for observer in &observers {
            observer.on_transition(self, expected, to);
        }

        if to == TaskState::Finished {
            let completions = std::mem::take(&mut *self.inner.completions.lock());
            for completion in completions {
                completion(self);
            }
        }
        Ok(())
    }

    /// Block until the task finishes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `Timeout` if the task is still unfinished when the wait gives up.
    pub fn wait(&self, timeout: Duration) -> Result<TaskOutcome, SchedulerError> {
        let deadline = Instant::now() + timeout;
        let mut core = self.inner.core.lock();
        while core.state != TaskState::Finished {
            if self.inner.finished.wait_until(&mut core, deadline).timed_out() {
                break;
            }
        }
        core.outcome.clone().ok_or(SchedulerError::Timeout)
    }

    /// Async variant of [`wait`](Self::wait); the Condvar wait runs on tokio's
    /// blocking pool.
    ///
    /// # Errors
    ///
    /// `Timeout` if the task does not finish in time, `Backend` if the blocking
    /// task could not be joined.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self, timeout: Duration) -> Result<TaskOutcome, SchedulerError> {
        let task = self.clone();
        tokio::task::spawn_blocking(move || task.wait(timeout))
            .await
            .map_err(|e| SchedulerError::Backend(format!("wait task failed: {e}")))?
    }
}

impl PartialEq for AsyncTask {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for AsyncTask {}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("priority", &self.inner.priority)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle given to a running task body.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: AsyncTask,
}

impl TaskContext {
    pub(crate) const fn new(task: AsyncTask) -> Self {
        Self { task }
    }

    /// The task being executed.
    #[must_use]
    pub const fn task(&self) -> &AsyncTask {
        &self.task
    }

    /// Whether the body should wind down.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Report completion. See [`AsyncTask::finish`].
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the task already finished.
    pub fn finish(&self) -> Result<(), SchedulerError> {
        self.task.finish()
    }

    /// Report failure. See [`AsyncTask::fail`].
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the task already finished.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), SchedulerError> {
        self.task.fail(reason)
    }

    /// Bound the task's run time: after `timeout` on `scheduler`, cancel it.
    ///
    /// The timer is revoked automatically when the task finishes first.
    ///
    /// # Errors
    ///
    /// Propagates the scheduler's error if the timer cannot be scheduled.
    pub fn cancel_after(
        &self,
        scheduler: &dyn Scheduler,
        timeout: Duration,
    ) -> Result<CancelToken, SchedulerError> {
        let task = self.task.clone();
        let token = scheduler.schedule_after(
            timeout,
            Duration::ZERO,
            Box::new(move || {
                warn!(task_id = task.id(), name = %task.name(), "task timed out");
                task.cancel();
            }),
        )?;
        let timer = token.clone();
        self.task.on_completion(move |_| {
            timer.cancel();
        });
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_task(priority: Priority) -> AsyncTask {
        AsyncTask::new("noop", priority, |_ctx| {})
    }

    #[test]
    fn test_happy_path_transitions() {
        let task = noop_task(Priority::NORMAL);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        task.add_observer(Arc::new(move |_: &AsyncTask, from: TaskState, to: TaskState| {
            s.lock().push((from, to));
        }));

        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(task.begin(), Ok(true));
        assert_eq!(task.state(), TaskState::Executing);
        task.finish().unwrap();
        assert_eq!(task.outcome(), Some(TaskOutcome::Succeeded));

        assert_eq!(
            *seen.lock(),
            vec![
                (TaskState::Ready, TaskState::Executing),
                (TaskState::Executing, TaskState::Finished),
            ]
        );
    }

    #[test]
    fn test_double_finish_is_invalid() {
        let task = noop_task(Priority::NORMAL);
        task.begin().unwrap();
        task.finish().unwrap();
        assert_eq!(
            task.finish(),
            Err(SchedulerError::InvalidTransition {
                from: TaskState::Finished,
                to: TaskState::Finished,
            })
        );
    }

    #[test]
    fn test_finish_from_ready_is_invalid() {
        let task = noop_task(Priority::NORMAL);
        assert!(matches!(
            task.finish(),
            Err(SchedulerError::InvalidTransition { from: TaskState::Ready, .. })
        ));
        assert_eq!(task.state(), TaskState::Ready);
    }

    #[test]
    fn test_cancel_ready_skips_executing() {
        let task = noop_task(Priority::NORMAL);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        task.add_observer(Arc::new(move |_: &AsyncTask, from: TaskState, to: TaskState| {
            s.lock().push((from, to));
        }));

        task.cancel();
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.outcome(), Some(TaskOutcome::Cancelled));
        assert_eq!(*seen.lock(), vec![(TaskState::Ready, TaskState::Finished)]);
        assert!(task.begin().is_err());
    }

    #[test]
    fn test_cancel_executing_is_cooperative() {
        let task = noop_task(Priority::NORMAL);
        task.begin().unwrap();
        task.cancel();
        assert!(task.is_cancelled());
        assert_eq!(task.state(), TaskState::Executing);

        task.finish().unwrap();
        assert_eq!(task.outcome(), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn test_fail_records_reason() {
        let task = noop_task(Priority::HIGH);
        task.begin().unwrap();
        task.fail("disk on fire").unwrap();
        assert_eq!(task.outcome(), Some(TaskOutcome::Failed("disk on fire".into())));
    }

    #[test]
    fn test_completion_callbacks() {
        let task = noop_task(Priority::NORMAL);
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        task.on_completion(move |t| {
            assert!(t.is_finished());
            h.fetch_add(1, Ordering::SeqCst);
        });
        task.begin().unwrap();
        task.finish().unwrap();

        let h = Arc::clone(&hits);
        task.on_completion(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wait_times_out_then_succeeds() {
        let task = noop_task(Priority::NORMAL);
        assert_eq!(task.wait(Duration::from_millis(10)), Err(SchedulerError::Timeout));

        task.begin().unwrap();
        let remote = task.clone();
        let finisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.finish().unwrap();
        });
        assert_eq!(task.wait(Duration::from_secs(5)), Ok(TaskOutcome::Succeeded));
        finisher.join().unwrap();
    }

    #[test]
    fn test_priority_levels_order() {
        assert!(Priority::VERY_HIGH > Priority::HIGH);
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::LOW);
        assert!(Priority::LOW > Priority::VERY_LOW);
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TaskState::Executing.to_string(), "executing");
        let err = SchedulerError::InvalidTransition {
            from: TaskState::Finished,
            to: TaskState::Executing,
        };
        assert_eq!(err.to_string(), "invalid transition: finished -> executing");
    }
}
