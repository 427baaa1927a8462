//! Configuration models for schedulers and task queues.

pub mod scheduler;

pub use scheduler::{RuntimeConfig, SchedulerConfig, SchedulerKind, TaskQueueConfig};
