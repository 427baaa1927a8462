//! Tests for configuration validation

use std::collections::HashMap;
use tickwork::config::{RuntimeConfig, SchedulerConfig, SchedulerKind, TaskQueueConfig};

#[test]
fn test_scheduler_config_defaults_are_valid() {
    for kind in [
        SchedulerKind::Immediate,
        SchedulerKind::Serial,
        SchedulerKind::Pool,
        SchedulerKind::Cooperative,
    ] {
        let cfg = SchedulerConfig::new(kind);
        assert!(cfg.validate().is_ok(), "{kind:?}");
        assert!(cfg.worker_count >= 1);
    }
}

#[test]
fn test_scheduler_config_invalid_worker_count() {
    let cfg = SchedulerConfig::new(SchedulerKind::Pool).with_worker_count(0);
    assert_eq!(cfg.validate(), Err("worker_count must be greater than 0".into()));
}

#[test]
fn test_scheduler_config_invalid_queue_depth() {
    let cfg = SchedulerConfig::new(SchedulerKind::Serial).with_max_queue_depth(0);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_stack_and_label() {
    assert!(SchedulerConfig::new(SchedulerKind::Pool)
        .with_thread_stack_size(1024)
        .validate()
        .is_err());
    assert!(SchedulerConfig::new(SchedulerKind::Pool)
        .with_label("  ")
        .validate()
        .is_err());
}

#[test]
fn test_task_queue_config_validation() {
    assert!(TaskQueueConfig::new(2, "io").validate().is_ok());
    assert!(TaskQueueConfig::new(0, "io").validate().is_err());
    assert!(TaskQueueConfig::new(1, "").validate().is_err());
}

#[test]
fn test_runtime_config_rejects_unknown_scheduler() {
    let mut schedulers = HashMap::new();
    schedulers.insert("io".to_string(), SchedulerConfig::new(SchedulerKind::Pool));
    let mut queues = HashMap::new();
    queues.insert("fetch".to_string(), TaskQueueConfig::new(2, "missing"));

    let cfg = RuntimeConfig { schedulers, queues };
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("missing"), "{err}");
}

#[test]
fn test_runtime_config_requires_a_scheduler() {
    assert!(RuntimeConfig::default().validate().is_err());
}

#[test]
fn test_runtime_config_from_json() {
    let json = r#"{
        "schedulers": {
            "io": { "kind": "pool", "worker_count": 4, "default_tolerance_ms": 5 },
            "ui": { "kind": "cooperative", "label": "main-loop" }
        },
        "queues": {
            "fetch": { "max_concurrency": 2, "scheduler": "io" }
        }
    }"#;
    let cfg = RuntimeConfig::from_json_str(json).unwrap();

    let io = &cfg.schedulers["io"];
    assert_eq!(io.kind, SchedulerKind::Pool);
    assert_eq!(io.label, "io");
    assert_eq!(io.worker_count, 4);
    assert_eq!(io.max_queue_depth, 1024);
    assert_eq!(cfg.schedulers["ui"].label, "main-loop");
    assert_eq!(cfg.queues["fetch"].max_concurrency, 2);
}

#[test]
fn test_runtime_config_from_json_errors() {
    let err = RuntimeConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"));

    let err = RuntimeConfig::from_json_str(r#"{ "schedulers": { "x": { "kind": "fiber" } } }"#)
        .unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_scheduler_kind_parses_case_insensitively() {
    assert_eq!("Serial".parse::<SchedulerKind>(), Ok(SchedulerKind::Serial));
    assert!("threads".parse::<SchedulerKind>().is_err());
}
