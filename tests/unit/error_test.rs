//! Tests for error types

use tickwork::core::{SchedulerError, TaskState};

#[test]
fn test_scheduler_closed_error() {
    let err = SchedulerError::SchedulerClosed("io".to_string());
    assert_eq!(format!("{err}"), "scheduler `io` is closed");
}

#[test]
fn test_invalid_transition_error() {
    let err = SchedulerError::InvalidTransition {
        from: TaskState::Finished,
        to: TaskState::Executing,
    };
    assert_eq!(format!("{err}"), "invalid transition: finished -> executing");
}

#[test]
fn test_queue_full_error() {
    let err = SchedulerError::QueueFull("serial".to_string());
    assert_eq!(format!("{err}"), "queue full: serial");
}

#[test]
fn test_misc_error_messages() {
    assert_eq!(SchedulerError::LoopBusy.to_string(), "loop is already running");
    assert_eq!(SchedulerError::Timeout.to_string(), "operation timed out");
    assert_eq!(
        SchedulerError::InvalidConfig("bad".into()).to_string(),
        "invalid configuration: bad"
    );
    assert_eq!(
        SchedulerError::Backend("connection failed".into()).to_string(),
        "backend error: connection failed"
    );
}

#[test]
fn test_errors_convert_into_anyhow() {
    let result: tickwork::core::AppResult<()> = Err(SchedulerError::Timeout.into());
    assert_eq!(result.unwrap_err().to_string(), "operation timed out");
}
