//! Core scheduling abstractions: schedulers, cancellation, tick fan-out and
//! task queues.

pub mod async_task;
pub mod cancel;
pub mod error;
pub mod group;
pub mod scheduler;
pub mod sink;
pub mod task_queue;
pub mod tick_source;

pub use async_task::{AsyncTask, Priority, TaskContext, TaskId, TaskObserver, TaskOutcome, TaskState};
pub use cancel::{CancelBag, CancelToken, TokenStatus};
pub use error::{AppResult, SchedulerError};
pub use group::WorkGroup;
pub use scheduler::{
    BoundedPool, CooperativeLoop, ImmediateScheduler, RepeatingWork, Scheduler, SchedulerExt,
    SchedulerStats, SerialQueue, Work,
};
pub use sink::{publish_sequence, ChannelSink, FnSink, Sink, SinkEvent};
pub use task_queue::{TaskQueue, TaskQueueStats};
pub use tick_source::{TickSource, TickStream};
