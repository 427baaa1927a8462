//! Dedicated worker threads fed by a bounded channel, plus the timer thread
//! that feeds them delayed work.
//!
//! # Design Principles
//!
//! - **No polling**: workers block on channel recv; timers sleep on a Condvar
//! - **Clean shutdown**: dropping the sender drains queued work then unblocks workers
//! - **Panic isolation**: a panicking item is logged and counted, the worker survives

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::core::{CancelToken, SchedulerError};

use super::timer::{Dispatch, TimerThread};
use super::{check_interval, run_guarded, RepeatingWork, SchedulerCounters, SchedulerStats, Work};

/// How long shutdown waits for each worker before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Fixed set of worker threads draining one channel.
pub(crate) struct WorkerSet {
    label: String,
    /// Work sender. Option allows clean shutdown by dropping.
    tx: Mutex<Option<Sender<Work>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<SchedulerCounters>,
}

impl WorkerSet {
    pub fn spawn(
        label: &str,
        worker_count: usize,
        max_queue_depth: usize,
        stack_size: usize,
        counters: Arc<SchedulerCounters>,
    ) -> Result<Self, SchedulerError> {
        let (tx, rx) = bounded::<Work>(max_queue_depth);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let handle = spawn_worker(label, worker_id, rx.clone(), Arc::clone(&counters), stack_size);
            match handle {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Unblock the workers that did start before bailing out.
                    drop(tx);
                    return Err(err);
                }
            }
        }

        Ok(Self {
            label: label.to_string(),
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            counters,
        })
    }

    /// Enqueue without blocking; a full channel is reported, never waited on.
    pub fn submit(&self, work: Work) -> Result<(), SchedulerError> {
        let tx_guard = self.tx.lock();
        let Some(tx) = tx_guard.as_ref() else {
            return Err(SchedulerError::SchedulerClosed(self.label.clone()));
        };
        match tx.try_send(work) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(label = %self.label, "dispatch queue is full");
                Err(SchedulerError::QueueFull(self.label.clone()))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(SchedulerError::SchedulerClosed(self.label.clone()))
            }
        }
    }

    /// Drop the sender and join workers, detaching any that overrun the timeout.
    pub fn shutdown(&self) {
        self.tx.lock().take();

        let mut handles = self.handles.lock();
        let worker_count = handles.len();
        for (idx, worker) in handles.drain(..).enumerate() {
            // A worker shutting down its own scheduler cannot join itself.
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            let joiner = thread::spawn(move || {
                let _ = done_tx.send(worker.join().is_ok());
            });
            match done_rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(true) => debug!(label = %self.label, worker_id = idx, "worker joined"),
                Ok(false) => warn!(label = %self.label, worker_id = idx, "worker panicked"),
                Err(_) => {
                    warn!(label = %self.label, worker_id = idx, "worker did not exit within timeout - detaching");
                    continue;
                }
            }
            let _ = joiner.join();
        }
        info!(label = %self.label, worker_count, "workers shut down");
    }
}

fn spawn_worker(
    label: &str,
    worker_id: usize,
    rx: Receiver<Work>,
    counters: Arc<SchedulerCounters>,
    stack_size: usize,
) -> Result<JoinHandle<()>, SchedulerError> {
    let thread_label = label.to_string();
    thread::Builder::new()
        .name(format!("{label}-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(label = %thread_label, worker_id, "worker thread started");
            // Returns Err once the sender is dropped and the channel is drained.
            while let Ok(work) = rx.recv() {
                run_guarded(&thread_label, work, &counters);
            }
            debug!(label = %thread_label, worker_id, "worker thread exiting");
        })
        .map_err(|e| SchedulerError::Backend(format!("failed to spawn worker thread: {e}")))
}

/// Workers plus a timer thread: the shared body of [`SerialQueue`] and
/// [`BoundedPool`].
///
/// [`SerialQueue`]: super::SerialQueue
/// [`BoundedPool`]: super::BoundedPool
pub(crate) struct ThreadedBackend {
    label: String,
    closed: AtomicBool,
    /// Floor applied to every one-shot tolerance.
    min_tolerance: Duration,
    counters: Arc<SchedulerCounters>,
    workers: Arc<WorkerSet>,
    timers: TimerThread,
}

impl ThreadedBackend {
    pub fn new(config: &SchedulerConfig, worker_count: usize) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let counters = Arc::new(SchedulerCounters::default());
        let workers = Arc::new(WorkerSet::spawn(
            &config.label,
            worker_count,
            config.max_queue_depth,
            config.thread_stack_size,
            Arc::clone(&counters),
        )?);

        let sink = Arc::clone(&workers);
        let dispatch: Dispatch = Arc::new(move |work| sink.submit(work));
        let timers = match TimerThread::spawn(&config.label, dispatch) {
            Ok(timers) => timers,
            Err(err) => {
                workers.shutdown();
                return Err(err);
            }
        };

        info!(
            label = %config.label,
            worker_count,
            max_queue_depth = config.max_queue_depth,
            "threaded scheduler initialized"
        );

        Ok(Self {
            label: config.label.clone(),
            closed: AtomicBool::new(false),
            min_tolerance: config.default_tolerance(),
            counters,
            workers,
            timers,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn ensure_open(&self) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::SchedulerClosed(self.label.clone()));
        }
        Ok(())
    }

    pub fn schedule_now(&self, work: Work) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        self.workers.submit(work)
    }

    pub fn schedule_after(
        &self,
        delay: Duration,
        tolerance: Duration,
        work: Work,
    ) -> Result<CancelToken, SchedulerError> {
        self.ensure_open()?;
        let tolerance = tolerance.max(self.min_tolerance);
        let token = self.timers.schedule_once(delay, tolerance, work)?;
        debug!(label = %self.label, token = %token.id(), ?delay, ?tolerance, "delayed work scheduled");
        Ok(token)
    }

    pub fn schedule_repeating(
        &self,
        interval: Duration,
        work: RepeatingWork,
    ) -> Result<CancelToken, SchedulerError> {
        self.ensure_open()?;
        check_interval(interval)?;
        let token = self.timers.schedule_repeating(interval, work)?;
        debug!(label = %self.label, token = %token.id(), ?interval, "recurring work scheduled");
        Ok(token)
    }

    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(label = %self.label, "shutting down scheduler");
        self.timers.shutdown();
        self.workers.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot(self.timers.pending())
    }
}

impl Drop for ThreadedBackend {
    fn drop(&mut self) {
        // Signal shutdown but don't join workers in Drop; explicit shutdown()
        // is required for graceful cleanup.
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.workers.tx.lock().take();
            debug!(label = %self.label, "scheduler dropped without explicit shutdown - workers will be detached");
        }
    }
}
