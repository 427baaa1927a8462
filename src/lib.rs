//! # tickwork
//!
//! Pluggable schedulers, shared periodic tick sources and a bounded-concurrency
//! task queue.
//!
//! The crate separates *what* runs from *where and when* it runs:
//!
//! - **Schedulers** ([`core::Scheduler`]) accept immediate, delayed and
//!   recurring work. Backends run it inline ([`core::ImmediateScheduler`]), on
//!   one dedicated thread ([`core::SerialQueue`]), on N threads
//!   ([`core::BoundedPool`]), inside an explicitly driven loop
//!   ([`core::CooperativeLoop`]) or on a tokio runtime (`runtime::TokioScheduler`,
//!   behind the default `tokio-runtime` feature).
//! - **Cancellation** ([`core::CancelToken`]) revokes delayed or recurring work.
//!   A token cancelled before its fire time guarantees the work never runs.
//! - **Tick sources** ([`core::TickSource`]) fan one recurring timer out to any
//!   number of subscribers.
//! - **Task queues** ([`core::TaskQueue`]) run [`core::AsyncTask`]s by priority
//!   with at most `max_concurrency` executing at once.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tickwork::core::{AsyncTask, Priority, SchedulerExt, SerialQueue, TaskQueue};
//!
//! let serial = Arc::new(SerialQueue::new("main")?);
//!
//! // Delayed work can be revoked before it fires.
//! let token = serial.run_after(Duration::from_secs(30), || println!("too late"))?;
//! token.cancel();
//!
//! // Two tasks at a time, highest priority first.
//! let queue = TaskQueue::new("uploads", 2, serial.clone())?;
//! let task = AsyncTask::from_fn("upload", Priority::HIGH, |_ctx| Ok(()));
//! queue.enqueue(&task)?;
//! task.wait(Duration::from_secs(5))?;
//! ```
//!
//! ## Configuration
//!
//! Schedulers and queues can be described in JSON and built in one go:
//!
//! ```rust,ignore
//! use tickwork::builders::build_runtime;
//! use tickwork::config::RuntimeConfig;
//!
//! let cfg = RuntimeConfig::from_json_str(r#"{
//!     "schedulers": { "io": { "kind": "pool", "worker_count": 4 } },
//!     "queues": { "fetch": { "max_concurrency": 2, "scheduler": "io" } }
//! }"#)?;
//! let runtime = build_runtime(&cfg)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions.
pub mod core;
/// Configuration models for schedulers and task queues.
pub mod config;
/// Builders to construct schedulers and queues from configuration.
pub mod builders;
/// Runtime adapters for async executors.
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
/// Shared utilities.
pub mod util;
