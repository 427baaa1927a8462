//! Completion tracking for a set of work items.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::core::{Scheduler, SchedulerError, Work};

struct GroupState {
    outstanding: usize,
    notify: Vec<(Arc<dyn Scheduler>, Work)>,
}

struct GroupInner {
    state: Mutex<GroupState>,
    drained: Condvar,
}

/// Counts work in flight and signals when the count returns to zero.
///
/// Cloning yields another handle to the same group.
#[derive(Clone)]
pub struct WorkGroup {
    inner: Arc<GroupInner>,
}

impl Default for WorkGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkGroup {
    /// Empty group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                state: Mutex::new(GroupState {
                    outstanding: 0,
                    notify: Vec::new(),
                }),
                drained: Condvar::new(),
            }),
        }
    }

    /// Register one more outstanding item.
    pub fn enter(&self) {
        self.inner.state.lock().outstanding += 1;
    }

    /// Mark one item done. Unbalanced calls are logged and ignored.
    pub fn leave(&self) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.outstanding == 0 {
                drop(state);
                warn!("work group left more often than entered");
                return;
            }
            state.outstanding -= 1;
            if state.outstanding > 0 {
                return;
            }
            std::mem::take(&mut state.notify)
        };
        self.inner.drained.notify_all();
        for (scheduler, work) in callbacks {
            if let Err(err) = scheduler.schedule_now(work) {
                warn!(label = %scheduler.label(), error = %err, "work group notification dropped");
            }
        }
    }

    /// Items entered but not yet left.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    /// Enter now and wrap `work` so it leaves when it returns, even by panic.
    #[must_use]
    pub fn wrap(&self, work: Work) -> Work {
        struct Leave(WorkGroup);
        impl Drop for Leave {
            fn drop(&mut self) {
                self.0.leave();
            }
        }

        self.enter();
        let guard = Leave(self.clone());
        Box::new(move || {
            let _guard = guard;
            work();
        })
    }

    /// Block until nothing is outstanding or `timeout` elapses. Returns whether
    /// the group drained.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.outstanding > 0 {
            if self.inner.drained.wait_until(&mut state, deadline).timed_out() {
                return state.outstanding == 0;
            }
        }
        true
    }

    /// Run `work` on `scheduler` once nothing is outstanding; right away if the
    /// group is already empty.
    ///
    /// # Errors
    ///
    /// Propagates the scheduler's error when the group is already empty and
    /// the work cannot be scheduled.
    pub fn notify(&self, scheduler: Arc<dyn Scheduler>, work: Work) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock();
            if state.outstanding > 0 {
                state.notify.push((scheduler, work));
                return Ok(());
            }
        }
        scheduler.schedule_now(work)
    }
}

impl std::fmt::Debug for WorkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGroup")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
