//! Revocable handles for deferred and recurring work.
//!
//! A [`CancelToken`] is shared between the scheduler that holds the pending
//! work and the caller that may revoke it. Its status moves once, from
//! `Pending` to either `Fired` (one-shot work ran) or `Cancelled`, and never
//! reverts.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::core::{Scheduler, SchedulerError};

/// Resolution status of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// Work is still scheduled.
    Pending,
    /// One-shot work was invoked.
    Fired,
    /// The token was cancelled before the work ran (or while it recurred).
    Cancelled,
}

type CancelHook = Box<dyn FnOnce() + Send>;

struct TokenState {
    status: TokenStatus,
    resolved_at: Option<Instant>,
}

struct TokenInner {
    id: Uuid,
    state: Mutex<TokenState>,
    resolved: Condvar,
    hooks: Mutex<Vec<CancelHook>>,
}

/// Identity-comparable, revocable handle to scheduled work.
///
/// Cancelling before the work fires guarantees it never runs. Cancelling after
/// it fired is a silent no-op. Cancellation is safe from any thread.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a fresh pending token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                id: Uuid::new_v4(),
                state: Mutex::new(TokenState {
                    status: TokenStatus::Pending,
                    resolved_at: None,
                }),
                resolved: Condvar::new(),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Unique identifier of this token.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TokenStatus {
        self.inner.state.lock().status
    }

    /// Whether the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status() == TokenStatus::Cancelled
    }

    /// Whether one-shot work behind this token has run.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.status() == TokenStatus::Fired
    }

    /// Instant at which the token fired or was cancelled.
    #[must_use]
    pub fn resolved_at(&self) -> Option<Instant> {
        self.inner.state.lock().resolved_at
    }

    /// Revoke the work. Returns `true` if this call performed the cancellation.
    ///
    /// Registered cancel hooks run on the calling thread after the status has
    /// been updated.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.status != TokenStatus::Pending {
                return false;
            }
            state.status = TokenStatus::Cancelled;
            state.resolved_at = Some(Instant::now());
        }
        self.inner.resolved.notify_all();

        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks {
            hook();
        }
        true
    }

    /// Atomically claim the right to run one-shot work.
    ///
    /// Returns `false` if the token was already cancelled (or fired).
    pub(crate) fn try_fire(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.status != TokenStatus::Pending {
            return false;
        }
        state.status = TokenStatus::Fired;
        state.resolved_at = Some(Instant::now());
        drop(state);
        self.inner.resolved.notify_all();
        self.inner.hooks.lock().clear();
        true
    }

    /// Run `hook` when the token is cancelled, or right away if it already is.
    ///
    /// Hooks are dropped without running if the token fires instead.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.status() {
            TokenStatus::Cancelled => hook(),
            TokenStatus::Fired => {}
            TokenStatus::Pending => {
                let mut hooks = self.inner.hooks.lock();
                // Re-check under the hooks lock: cancel() takes the hooks after
                // publishing its status.
                if self.inner.state.lock().status == TokenStatus::Cancelled {
                    drop(hooks);
                    hook();
                } else {
                    hooks.push(Box::new(hook));
                }
            }
        }
    }

    /// Block until the token is cancelled or `deadline` passes.
    ///
    /// Returns `true` if the token was cancelled.
    pub(crate) fn wait_cancelled_until(&self, deadline: Instant) -> bool {
        let mut state = self.inner.state.lock();
        while state.status == TokenStatus::Pending {
            if self.inner.resolved.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.status == TokenStatus::Cancelled
    }

    /// Schedule a one-shot teardown that cancels this token after `delay`.
    ///
    /// The teardown runs on `scheduler`; pass the scheduler that delivers the
    /// work this token guards so the teardown cannot race an in-flight item.
    ///
    /// # Errors
    ///
    /// Propagates the scheduler's error if the teardown cannot be scheduled.
    pub fn cancel_after(
        &self,
        scheduler: &dyn Scheduler,
        delay: Duration,
        tolerance: Duration,
    ) -> Result<Self, SchedulerError> {
        let target = self.clone();
        scheduler.schedule_after(
            delay,
            tolerance,
            Box::new(move || {
                if target.cancel() {
                    tracing::info!(token = %target.id(), "deferred cancellation fired");
                }
            }),
        )
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CancelToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for CancelToken {}

impl Hash for CancelToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CancelToken")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("resolved_at", &state.resolved_at)
            .finish()
    }
}

/// Owned set of tokens that are cancelled together.
///
/// Dropping the bag cancels everything still in it.
#[derive(Debug, Default)]
pub struct CancelBag {
    tokens: Mutex<Vec<CancelToken>>,
}

impl CancelBag {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a token.
    pub fn insert(&self, token: CancelToken) {
        let mut tokens = self.tokens.lock();
        tokens.retain(|t| t.status() == TokenStatus::Pending);
        tokens.push(token);
    }

    /// Number of tokens held that are still pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens
            .lock()
            .iter()
            .filter(|t| t.status() == TokenStatus::Pending)
            .count()
    }

    /// Whether no pending token is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel and release every token. Returns how many were actually cancelled.
    pub fn cancel_all(&self) -> usize {
        let tokens = std::mem::take(&mut *self.tokens.lock());
        tokens.iter().filter(|t| t.cancel()).count()
    }

    /// Schedule [`cancel_all`](Self::cancel_all) on `scheduler` after `delay`.
    ///
    /// # Errors
    ///
    /// Propagates the scheduler's error if the teardown cannot be scheduled.
    pub fn cancel_all_after(
        self: &Arc<Self>,
        scheduler: &dyn Scheduler,
        delay: Duration,
        tolerance: Duration,
    ) -> Result<CancelToken, SchedulerError> {
        let bag = Arc::downgrade(self);
        scheduler.schedule_after(
            delay,
            tolerance,
            Box::new(move || {
                if let Some(bag) = bag.upgrade() {
                    let cancelled = bag.cancel_all();
                    tracing::info!(cancelled, "cancel bag emptied by deferred teardown");
                }
            }),
        )
    }
}

impl Drop for CancelBag {
    fn drop(&mut self) {
        for token in self.tokens.get_mut().drain(..) {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cancel_is_monotonic() {
        let token = CancelToken::new();
        assert_eq!(token.status(), TokenStatus::Pending);
        assert!(token.resolved_at().is_none());

        assert!(token.cancel());
        assert!(token.is_cancelled());
        assert!(token.resolved_at().is_some());

        // Second cancel is a no-op, and the token can no longer fire.
        assert!(!token.cancel());
        assert!(!token.try_fire());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let token = CancelToken::new();
        assert!(token.try_fire());
        assert!(!token.cancel());
        assert!(token.is_fired());
    }

    #[test]
    fn test_hooks_run_once_on_cancel() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel();
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Late registration on a cancelled token runs immediately.
        let h = Arc::clone(&hits);
        token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hooks_dropped_on_fire() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        token.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(token.try_fire());
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_identity_equality() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a.clone());
        set.insert(a.clone());
        set.insert(b);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_wait_cancelled_until_wakes_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let cancelled = token.wait_cancelled_until(Instant::now() + Duration::from_secs(5));
        assert!(cancelled);
        handle.join().unwrap();
    }

    #[test]
    fn test_bag_cancels_on_drop() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        {
            let bag = CancelBag::new();
            bag.insert(a.clone());
            bag.insert(b.clone());
            assert_eq!(bag.len(), 2);
        }
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn test_bag_cancel_all_counts_pending_only() {
        let bag = CancelBag::new();
        let fired = CancelToken::new();
        bag.insert(fired.clone());
        bag.insert(CancelToken::new());
        assert!(fired.try_fire());
        assert_eq!(bag.cancel_all(), 1);
        assert!(bag.is_empty());
    }
}
