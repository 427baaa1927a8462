//! Shared periodic tick source with fan-out to many subscribers.
//!
//! However many sinks subscribe, the source holds exactly one recurring timer
//! on its scheduler. The timer starts with the first subscriber and stops with
//! the last one, at which point the counter goes back to zero.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::{CancelToken, ChannelSink, Scheduler, SchedulerError, Sink, SinkEvent};
use crate::util::now_ms;

struct Subscriber {
    token: CancelToken,
    sink: Arc<dyn Sink<u64>>,
    receive_on: Arc<dyn Scheduler>,
}

/// Each subscription cycle gets a fresh generation; a recurrence that finds
/// another generation in the slot is stale and cancels itself.
enum TimerSlot {
    Idle,
    Starting(u64),
    Running(u64, CancelToken),
}

impl TimerSlot {
    const fn generation(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Starting(generation) | Self::Running(generation, _) => Some(*generation),
        }
    }
}

struct SourceState {
    counter: u64,
    subscribers: Vec<Subscriber>,
    timer: TimerSlot,
    next_generation: u64,
}

struct SourceInner {
    interval: Duration,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<SourceState>,
}

impl Drop for SourceInner {
    fn drop(&mut self) {
        if let TimerSlot::Running(_, token) = &self.state.get_mut().timer {
            token.cancel();
        }
    }
}

/// Periodic counter shared by any number of subscribers.
///
/// Cloning yields another handle to the same source. Once every handle is gone
/// the timer stops.
#[derive(Clone)]
pub struct TickSource {
    inner: Arc<SourceInner>,
}

impl TickSource {
    /// Create a source ticking every `interval` on `scheduler`.
    ///
    /// No timer is started until the first [`subscribe`](Self::subscribe).
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a zero interval.
    pub fn new(interval: Duration, scheduler: Arc<dyn Scheduler>) -> Result<Self, SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "tick interval must be non-zero".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(SourceInner {
                interval,
                scheduler,
                state: Mutex::new(SourceState {
                    counter: 0,
                    subscribers: Vec::new(),
                    timer: TimerSlot::Idle,
                    next_generation: 0,
                }),
            }),
        })
    }

    /// Tick every `interval` on `scheduler` and collect the values in a
    /// blocking iterator.
    ///
    /// The stream ends once the returned token is cancelled. Dropping the
    /// stream cancels the token.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new) and [`subscribe`](Self::subscribe).
    pub fn start(
        interval: Duration,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<(TickStream, CancelToken), SchedulerError> {
        let source = Self::new(interval, Arc::clone(&scheduler))?;
        let (sink, rx) = ChannelSink::unbounded();
        let token = source.subscribe(Arc::new(sink), scheduler)?;
        let stream = TickStream {
            _source: source,
            rx,
            token: token.clone(),
            done: false,
        };
        Ok((stream, token))
    }

    /// Tick interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Last value emitted, or zero if no tick happened since the timer started.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.inner.state.lock().counter
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Attach `sink`. Every tick is delivered to it through
    /// `receive_on.schedule_now`.
    ///
    /// Cancelling the returned token detaches the sink; a value already queued
    /// on `receive_on` is dropped rather than delivered. The sink then receives
    /// `on_complete(None)`.
    ///
    /// # Errors
    ///
    /// Propagates the scheduler's error if the shared timer cannot be started.
    pub fn subscribe(
        &self,
        sink: Arc<dyn Sink<u64>>,
        receive_on: Arc<dyn Scheduler>,
    ) -> Result<CancelToken, SchedulerError> {
        let token = CancelToken::new();
        let start_timer = {
            let mut state = self.inner.state.lock();
            state.subscribers.push(Subscriber {
                token: token.clone(),
                sink,
                receive_on,
            });
            if matches!(state.timer, TimerSlot::Idle) {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.timer = TimerSlot::Starting(generation);
                Some(generation)
            } else {
                None
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let id = token.clone();
        token.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                detach(&inner, &id, None);
            }
        });

        if let Some(generation) = start_timer {
            if let Err(err) = self.start_timer(generation) {
                {
                    let mut state = self.inner.state.lock();
                    if state.timer.generation() == Some(generation) {
                        state.timer = TimerSlot::Idle;
                    }
                }
                token.cancel();
                return Err(err);
            }
        }
        debug!(interval_ms = self.inner.interval.as_millis(), "tick subscriber attached");
        Ok(token)
    }

    /// Detach every subscriber and stop the timer.
    pub fn cancel(&self) {
        let tokens: Vec<CancelToken> = self
            .inner
            .state
            .lock()
            .subscribers
            .iter()
            .map(|s| s.token.clone())
            .collect();
        for token in tokens {
            token.cancel();
        }
    }

    fn start_timer(&self, generation: u64) -> Result<(), SchedulerError> {
        let weak: Weak<SourceInner> = Arc::downgrade(&self.inner);
        let timer = self.inner.scheduler.schedule_repeating(
            self.inner.interval,
            Box::new(move |timer: &CancelToken| match weak.upgrade() {
                Some(inner) => on_tick(&inner, generation, timer),
                None => {
                    timer.cancel();
                }
            }),
        )?;

        let mut state = self.inner.state.lock();
        if matches!(state.timer, TimerSlot::Starting(current) if current == generation) {
            info!(
                label = %self.inner.scheduler.label(),
                interval_ms = self.inner.interval.as_millis(),
                generation,
                started_at_ms = now_ms(),
                "tick timer started"
            );
            state.timer = TimerSlot::Running(generation, timer);
        } else {
            // Everyone left while the timer was being set up, possibly followed
            // by a new cycle with its own timer.
            drop(state);
            debug!(generation, "tick timer outlived its subscribers");
            timer.cancel();
        }
        Ok(())
    }
}

fn on_tick(inner: &SourceInner, generation: u64, timer: &CancelToken) {
    let (value, targets) = {
        let mut state = inner.state.lock();
        if state.timer.generation() != Some(generation) {
            drop(state);
            debug!(generation, "stale tick recurrence cancelled");
            timer.cancel();
            return;
        }
        state.counter += 1;
        let targets: Vec<(CancelToken, Arc<dyn Sink<u64>>, Arc<dyn Scheduler>)> = state
            .subscribers
            .iter()
            .map(|s| (s.token.clone(), Arc::clone(&s.sink), Arc::clone(&s.receive_on)))
            .collect();
        (state.counter, targets)
    };

    for (token, sink, receive_on) in targets {
        if token.is_cancelled() {
            continue;
        }
        let guard = token.clone();
        let target = Arc::clone(&sink);
        let delivered = receive_on.schedule_now(Box::new(move || {
            if !guard.is_cancelled() {
                target.on_value(value);
            }
        }));
        if let Err(err) = delivered {
            warn!(label = %receive_on.label(), error = %err, "tick delivery failed, detaching subscriber");
            detach(inner, &token, Some(err));
            token.cancel();
        }
    }
}

/// Remove the subscriber owning `token`. Returns it and, if it was the last
/// one, the timer to cancel.
fn remove_subscriber(
    inner: &SourceInner,
    token: &CancelToken,
) -> (Option<Subscriber>, Option<CancelToken>) {
    let mut state = inner.state.lock();
    let removed = state
        .subscribers
        .iter()
        .position(|s| s.token == *token)
        .map(|idx| state.subscribers.remove(idx));
    let mut timer = None;
    if removed.is_some() && state.subscribers.is_empty() {
        state.counter = 0;
        // A cycle still starting is cancelled by its own first tick or by start_timer.
        if let TimerSlot::Running(_, t) = std::mem::replace(&mut state.timer, TimerSlot::Idle) {
            timer = Some(t);
        }
    }
    (removed, timer)
}

/// Drop a subscriber and complete its sink, with `error` if delivery failed.
fn detach(inner: &SourceInner, token: &CancelToken, error: Option<SchedulerError>) {
    let (removed, timer) = remove_subscriber(inner, token);
    if let Some(timer) = timer {
        timer.cancel();
        info!(label = %inner.scheduler.label(), "last tick subscriber left, timer stopped");
    }
    let Some(subscriber) = removed else { return };
    if let Some(err) = error {
        subscriber.sink.on_complete(Some(err));
        return;
    }
    let sink = Arc::clone(&subscriber.sink);
    // Completion goes through the same context as the values so it lands after them.
    if let Err(err) = subscriber
        .receive_on
        .schedule_now(Box::new(move || sink.on_complete(None)))
    {
        subscriber.sink.on_complete(Some(err));
    }
}

impl fmt::Debug for TickSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TickSource")
            .field("interval", &self.inner.interval)
            .field("scheduler", &self.inner.scheduler.label())
            .field("counter", &state.counter)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

/// Blocking iterator over tick values produced by [`TickSource::start`].
///
/// Infinite until its token is cancelled; it cannot be restarted afterwards.
pub struct TickStream {
    _source: TickSource,
    rx: Receiver<SinkEvent<u64>>,
    token: CancelToken,
    done: bool,
}

impl TickStream {
    /// Token controlling this stream.
    #[must_use]
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Non-blocking variant of `next`: returns an already delivered value, if any.
    pub fn try_next(&mut self) -> Option<u64> {
        if self.done {
            return None;
        }
        match self.rx.try_recv() {
            Ok(SinkEvent::Value(v)) => Some(v),
            Ok(SinkEvent::Complete(_)) => {
                self.done = true;
                None
            }
            Err(_) => None,
        }
    }
}

impl Iterator for TickStream {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(SinkEvent::Value(v)) => Some(v),
            Ok(SinkEvent::Complete(_)) | Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl Drop for TickStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for TickStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickStream")
            .field("token", &self.token)
            .field("done", &self.done)
            .finish()
    }
}
