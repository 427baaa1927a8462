//! Error types for scheduler and task-queue operations.

use thiserror::Error;

use crate::core::TaskState;

/// Errors produced by schedulers, tick sources and task queues.
///
/// Cancellation is deliberately absent: a cancelled token or task is a normal
/// terminal outcome, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// A scheduling call was made after the named scheduler shut down.
    #[error("scheduler `{0}` is closed")]
    SchedulerClosed(String),
    /// A task state transition that the life-cycle does not permit.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// State the task was in.
        from: TaskState,
        /// State the caller tried to reach.
        to: TaskState,
    },
    /// The dispatch queue of a scheduler has no room left.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// Configuration or argument rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A cooperative loop is already being driven by another caller.
    #[error("loop is already running")]
    LoopBusy,
    /// A blocking wait gave up.
    #[error("operation timed out")]
    Timeout,
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
