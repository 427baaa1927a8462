//! Integration tests for TaskQueue scheduling and the AsyncTask life-cycle
//!
//! These tests validate:
//! - FIFO execution at max_concurrency = 1
//! - Priority ordering when capacity frees up
//! - Cooperative cancellation
//! - Concurrency limits under a real thread pool

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickwork::core::{
    AsyncTask, BoundedPool, ImmediateScheduler, Priority, Scheduler, SchedulerError, SerialQueue,
    TaskContext, TaskOutcome, TaskQueue, TaskState,
};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Task whose body parks its context so the test decides when it finishes.
fn manual_task(name: &str, priority: Priority, parked: &Arc<Mutex<Vec<(String, TaskContext)>>>) -> AsyncTask {
    let parked = Arc::clone(parked);
    let label = name.to_string();
    AsyncTask::new(name, priority, move |ctx| parked.lock().push((label, ctx)))
}

// ============================================================================
// ORDERING
// ============================================================================

#[test]
fn test_single_slot_runs_fifo_one_at_a_time() {
    let serial = Arc::new(SerialQueue::new("fifo").unwrap());
    let queue = TaskQueue::new("fifo", 1, serial.clone()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<AsyncTask> = (0..3)
        .map(|i| {
            let order = Arc::clone(&order);
            let max_seen = Arc::clone(&max_seen);
            let observer = queue.clone();
            AsyncTask::from_fn(format!("task-{i}"), Priority::NORMAL, move |_| {
                max_seen.fetch_max(observer.running_count(), Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                order.lock().push(i);
                Ok(())
            })
        })
        .collect();
    for task in &tasks {
        queue.enqueue(task).unwrap();
    }
    assert!(queue.running_count() <= 1);

    assert!(queue.wait_until_all_finished(Duration::from_secs(5)));
    assert_eq!(*order.lock(), vec![0, 1, 2]);
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(queue.stats().peak_running, 1);
    for task in &tasks {
        assert_eq!(task.outcome(), Some(TaskOutcome::Succeeded));
    }
    serial.shutdown();
}

#[test]
fn test_high_priority_starts_before_low() {
    let queue = TaskQueue::new("prio", 1, Arc::new(ImmediateScheduler::new("prio"))).unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));

    let blocker = manual_task("blocker", Priority::NORMAL, &parked);
    let low = manual_task("L", Priority::LOW, &parked);
    let high = manual_task("H", Priority::HIGH, &parked);
    queue.enqueue(&blocker).unwrap();
    queue.enqueue(&low).unwrap();
    queue.enqueue(&high).unwrap();
    assert_eq!(low.state(), TaskState::Ready);
    assert_eq!(high.state(), TaskState::Ready);

    let (_, ctx) = parked.lock().remove(0);
    ctx.finish().unwrap();
    let (name, ctx) = parked.lock().remove(0);
    assert_eq!(name, "H");
    assert_eq!(low.state(), TaskState::Ready);

    ctx.finish().unwrap();
    let (name, ctx) = parked.lock().remove(0);
    assert_eq!(name, "L");
    ctx.finish().unwrap();
    assert_eq!(queue.running_count(), 0);
}

#[test]
fn test_random_priorities_start_in_priority_order() {
    let mut rng = rand::rng();
    let queue = TaskQueue::new("random", 1, Arc::new(ImmediateScheduler::new("random"))).unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));

    let blocker = manual_task("blocker", Priority::VERY_HIGH, &parked);
    queue.enqueue(&blocker).unwrap();

    let mut expected = Vec::new();
    for i in 0..50 {
        let priority = Priority(rng.random_range(-8..=8));
        let name = format!("t{i}");
        queue.enqueue(&manual_task(&name, priority, &parked)).unwrap();
        expected.push((priority, i, name));
    }
    // Highest priority first, insertion order among equals.
    expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut started = Vec::new();
    loop {
        let next = {
            let mut parked = parked.lock();
            if parked.is_empty() {
                break;
            }
            parked.remove(0)
        };
        if next.0 != "blocker" {
            started.push(next.0.clone());
        }
        next.1.finish().unwrap();
    }
    let expected: Vec<String> = expected.into_iter().map(|(_, _, name)| name).collect();
    assert_eq!(started, expected);
}

// ============================================================================
// CANCELLATION AND ERRORS
// ============================================================================

#[test]
fn test_cancel_all_finishes_ready_and_flags_running() {
    let queue = TaskQueue::new("cancel", 2, Arc::new(ImmediateScheduler::new("cancel"))).unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<AsyncTask> = (0..5)
        .map(|i| manual_task(&format!("c{i}"), Priority::NORMAL, &parked))
        .collect();
    for task in &tasks {
        queue.enqueue(task).unwrap();
    }
    assert_eq!(queue.running_count(), 2);
    assert_eq!(queue.pending_count(), 3);

    queue.cancel_all();
    assert_eq!(queue.pending_count(), 0);
    for task in &tasks[2..] {
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.outcome(), Some(TaskOutcome::Cancelled));
    }
    for task in &tasks[..2] {
        assert_eq!(task.state(), TaskState::Executing);
        assert!(task.is_cancelled());
    }

    let running: Vec<TaskContext> = parked.lock().drain(..).map(|(_, ctx)| ctx).collect();
    assert_eq!(running.len(), 2);
    for ctx in running {
        assert!(ctx.is_cancelled());
        ctx.finish().unwrap();
    }
    assert!(queue.wait_until_all_finished(Duration::from_millis(10)));
}

#[test]
fn test_finish_twice_is_rejected() {
    let queue = TaskQueue::new("twice", 1, Arc::new(ImmediateScheduler::new("twice"))).unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    let task = manual_task("once", Priority::NORMAL, &parked);
    queue.enqueue(&task).unwrap();

    let (_, ctx) = parked.lock().remove(0);
    ctx.finish().unwrap();
    assert_eq!(
        ctx.finish(),
        Err(SchedulerError::InvalidTransition {
            from: TaskState::Finished,
            to: TaskState::Finished,
        })
    );
    assert_eq!(queue.stats().finished, 1);
}

#[test]
fn test_cancel_after_bounds_running_task() {
    let pool = Arc::new(BoundedPool::new("deadline", 2).unwrap());
    let queue = TaskQueue::new("deadline", 1, pool.clone()).unwrap();
    let timer_scheduler = pool.clone();
    let task = AsyncTask::from_fn("slow", Priority::NORMAL, move |ctx| {
        ctx.cancel_after(timer_scheduler.as_ref(), Duration::from_millis(30))
            .map_err(|e| e.to_string())?;
        while !ctx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    });
    queue.enqueue(&task).unwrap();

    assert_eq!(task.wait(Duration::from_secs(5)), Ok(TaskOutcome::Cancelled));
    pool.shutdown();
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn test_pool_never_exceeds_max_concurrency() {
    let pool = Arc::new(BoundedPool::new("limit", 8).unwrap());
    let queue = TaskQueue::new("limit", 3, pool.clone()).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..30 {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let task = AsyncTask::from_fn(format!("w{i}"), Priority::NORMAL, move |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        queue.enqueue(&task).unwrap();
    }

    assert!(queue.wait_until_all_finished(Duration::from_secs(10)));
    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = queue.stats();
    assert_eq!(stats.finished, 30);
    assert!(stats.peak_running <= 3);
    pool.shutdown();
}

#[test]
fn test_raising_concurrency_starts_pending_tasks() {
    let queue = TaskQueue::new("grow", 1, Arc::new(ImmediateScheduler::new("grow"))).unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    for i in 0..4 {
        queue
            .enqueue(&manual_task(&format!("g{i}"), Priority::NORMAL, &parked))
            .unwrap();
    }
    assert_eq!(queue.running_count(), 1);

    queue.set_max_concurrency(3).unwrap();
    assert_eq!(queue.running_count(), 3);
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(parked.lock().len(), 3);
}
