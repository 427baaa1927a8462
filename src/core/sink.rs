//! Consumer contract for produced values.
//!
//! The core never looks at what a sink does with a value; it only promises to
//! call [`Sink::on_value`] from the execution context the producer was told to
//! deliver on, and [`Sink::on_complete`] at most once at the end.

use std::marker::PhantomData;

use crossbeam_channel::{Receiver, Sender};

use crate::core::{Scheduler, SchedulerError};

/// Receiver of a value sequence.
pub trait Sink<T>: Send + Sync {
    /// A new value is available.
    fn on_value(&self, value: T);

    /// The sequence ended, either normally (`None`) or with an error.
    fn on_complete(&self, error: Option<SchedulerError>) {
        if let Some(err) = error {
            tracing::debug!(error = %err, "sink completed with error");
        }
    }
}

/// Sink that forwards values to a closure.
pub struct FnSink<T, F> {
    f: F,
    _value: PhantomData<fn(T)>,
}

impl<T, F> FnSink<T, F>
where
    F: Fn(T) + Send + Sync,
{
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self {
            f,
            _value: PhantomData,
        }
    }
}

impl<T, F> Sink<T> for FnSink<T, F>
where
    F: Fn(T) + Send + Sync,
{
    fn on_value(&self, value: T) {
        (self.f)(value);
    }
}

/// Message carried by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent<T> {
    /// A delivered value.
    Value(T),
    /// Completion, with the error if the sequence failed.
    Complete(Option<SchedulerError>),
}

/// Sink that pushes every event into a crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelSink<T> {
    tx: Sender<SinkEvent<T>>,
}

impl<T> ChannelSink<T> {
    /// Create a sink and the receiving end of its channel.
    #[must_use]
    pub fn unbounded() -> (Self, Receiver<SinkEvent<T>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl<T: Send> Sink<T> for ChannelSink<T> {
    fn on_value(&self, value: T) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(SinkEvent::Value(value));
    }

    fn on_complete(&self, error: Option<SchedulerError>) {
        let _ = self.tx.send(SinkEvent::Complete(error));
    }
}

/// Deliver a finite batch through `scheduler`, then complete the sink.
///
/// Values keep their order on schedulers that preserve submission order. If a
/// value cannot be scheduled, delivery stops and the sink is completed with the
/// error, which is also returned.
///
/// # Errors
///
/// Returns the first scheduling failure.
pub fn publish_sequence<T, I, S>(
    values: I,
    scheduler: &dyn Scheduler,
    sink: std::sync::Arc<S>,
) -> Result<usize, SchedulerError>
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    S: Sink<T> + ?Sized + 'static,
{
    let mut delivered = 0;
    for value in values {
        let target = std::sync::Arc::clone(&sink);
        if let Err(err) = scheduler.schedule_now(Box::new(move || target.on_value(value))) {
            tracing::warn!(label = scheduler.label(), error = %err, "sequence delivery aborted");
            sink.on_complete(Some(err.clone()));
            return Err(err);
        }
        delivered += 1;
    }

    let target = std::sync::Arc::clone(&sink);
    if let Err(err) = scheduler.schedule_now(Box::new(move || target.on_complete(None))) {
        sink.on_complete(Some(err.clone()));
        return Err(err);
    }
    Ok(delivered)
}
