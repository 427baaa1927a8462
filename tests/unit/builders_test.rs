//! Tests for builder modules

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickwork::builders::{build_runtime, build_scheduler};
use tickwork::config::{RuntimeConfig, SchedulerConfig, SchedulerKind};
use tickwork::core::{AsyncTask, Priority, Scheduler, SchedulerError, SchedulerExt, TaskOutcome};

#[test]
fn test_build_each_scheduler_kind() {
    for kind in [
        SchedulerKind::Immediate,
        SchedulerKind::Serial,
        SchedulerKind::Pool,
        SchedulerKind::Cooperative,
    ] {
        let cfg = SchedulerConfig::new(kind).with_label(format!("built-{kind:?}")).with_worker_count(2);
        let scheduler = build_scheduler(&cfg).unwrap();
        assert_eq!(scheduler.label(), cfg.label);
        scheduler.shutdown();
        assert!(scheduler.is_closed());
    }
}

#[test]
fn test_build_scheduler_rejects_invalid_config() {
    let cfg = SchedulerConfig::new(SchedulerKind::Pool).with_worker_count(0);
    assert!(matches!(build_scheduler(&cfg), Err(SchedulerError::InvalidConfig(_))));
}

#[test]
fn test_build_runtime_wires_queues() {
    let cfg = RuntimeConfig::from_json_str(
        r#"{
            "schedulers": {
                "io": { "kind": "pool", "worker_count": 2 },
                "main": { "kind": "cooperative" }
            },
            "queues": { "fetch": { "max_concurrency": 1, "scheduler": "io" } }
        }"#,
    )
    .unwrap();
    let runtime = build_runtime(&cfg).unwrap();

    let queue = runtime.queue("fetch").unwrap();
    assert_eq!(queue.scheduler().label(), "io");
    let task = AsyncTask::from_fn("fetch-1", Priority::NORMAL, |_| Ok(()));
    queue.enqueue(&task).unwrap();
    assert_eq!(task.wait(Duration::from_secs(5)), Ok(TaskOutcome::Succeeded));

    let main = runtime.scheduler("main").unwrap();
    let driver = runtime.cooperative("main").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    main.run_now(move || {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(driver.run_until_idle().unwrap(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(runtime.cooperative("io").is_none());
    assert_eq!(runtime.scheduler_names().count(), 2);
    runtime.shutdown();
    assert!(runtime.scheduler("io").unwrap().is_closed());
}
