//! Runtime adapters that plug an async runtime in as a [`Scheduler`].
//!
//! [`Scheduler`]: crate::core::Scheduler

pub mod tokio_scheduler;

pub use tokio_scheduler::TokioScheduler;
