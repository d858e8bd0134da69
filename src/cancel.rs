use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// Cancellation signal shared between a caller and the worker threads it starts.
///
/// Clones observe the same signal. A child token is cancelled when its parent is, or when
/// its own deadline passes, but cancelling a child leaves the parent alone.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    cancelled: bool,
    children: Vec<Weak<Inner>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.children)
        };
        self.cond.notify_all();

        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Default::default()
    }

    /// A child token sharing the parent's deadline.
    pub fn child(&self) -> Self {
        self.child_until(None)
    }

    /// A child token which also expires after `timeout`.
    ///
    /// A timeout too large to represent never expires.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.child_until(Instant::now().checked_add(timeout))
    }

    fn child_until(&self, deadline: Option<Instant>) -> Self {
        let deadline = match (self.deadline, deadline) {
            (Some(p), Some(d)) => Some(p.min(d)),
            (p, d) => p.or(d),
        };
        let child = CancelToken {
            inner: Default::default(),
            deadline,
        };

        let mut state = self.inner.lock();
        if state.cancelled {
            child.inner.lock().cancelled = true;
        } else {
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }

        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled || self.expired(Instant::now())
    }

    /// Blocks until cancelled.
    pub fn wait(&self) {
        self.wait_until(None);
    }

    /// Blocks for at most `timeout`, returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now().checked_add(timeout))
    }

    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    fn wait_until(&self, until: Option<Instant>) -> bool {
        let until = match (until, self.deadline) {
            (Some(u), Some(d)) => Some(u.min(d)),
            (u, d) => u.or(d),
        };

        let mut state = self.inner.lock();
        loop {
            let now = Instant::now();
            if state.cancelled || self.expired(now) {
                return true;
            }

            state = match until {
                None => self
                    .inner
                    .cond
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(u) if now >= u => return false,
                Some(u) => {
                    self.inner
                        .cond
                        .wait_timeout(state, u - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }
}
