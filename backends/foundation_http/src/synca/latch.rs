//! Set-once value observable by any number of waiters.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use super::lock_or_recover;

struct LatchState<T> {
    value: Option<T>,
    wakers: Vec<Waker>,
}

struct LatchInner<T> {
    state: Mutex<LatchState<T>>,
    ready: Condvar,
}

/// `Latch` moves exactly once from unset to set. Every observer, whether it
/// blocks or awaits, sees the same cloned value, including observers that
/// arrive after the latch was set.
pub struct Latch<T> {
    inner: Arc<LatchInner<T>>,
}

impl<T> Clone for Latch<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("value", &self.get()).finish()
    }
}

impl<T: Clone> Latch<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LatchInner {
                state: Mutex::new(LatchState {
                    value: None,
                    wakers: Vec::new(),
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Sets the latch. Returns false, leaving the first value in place, when
    /// it was already set.
    pub fn set(&self, value: T) -> bool {
        let mut state = lock_or_recover(&self.inner.state);
        if state.value.is_some() {
            return false;
        }

        state.value = Some(value);
        let wakers = std::mem::take(&mut state.wakers);
        drop(state);

        self.inner.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    #[must_use]
    pub fn get(&self) -> Option<T> {
        lock_or_recover(&self.inner.state).value.clone()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        lock_or_recover(&self.inner.state).value.is_some()
    }

    /// Blocks until the latch is set.
    pub fn wait(&self) -> T {
        let mut state = lock_or_recover(&self.inner.state);
        loop {
            if let Some(value) = &state.value {
                return value.clone();
            }
            state = match self.inner.ready.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Blocks for at most `timeout`, returning `None` if still unset.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = lock_or_recover(&self.inner.state);
        loop {
            if let Some(value) = &state.value {
                return Some(value.clone());
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            state = match self.inner.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Returns a handle that resolves once the latch is set.
    #[must_use]
    pub fn listen(&self) -> LatchWait<T> {
        LatchWait {
            latch: self.clone(),
        }
    }

    fn poll_value(&self, cx: &Context<'_>) -> Poll<T> {
        let mut state = lock_or_recover(&self.inner.state);
        if let Some(value) = &state.value {
            return Poll::Ready(value.clone());
        }

        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Suspending handle over a [`Latch`]. Block on it with [`LatchWait::wait`]
/// or `.await` it.
pub struct LatchWait<T> {
    latch: Latch<T>,
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for LatchWait<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatchWait")
            .field("value", &self.latch.get())
            .finish()
    }
}

impl<T: Clone> LatchWait<T> {
    pub fn wait(self) -> T {
        self.latch.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.latch.wait_timeout(timeout)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.latch.is_set()
    }
}

impl<T: Clone> Future for LatchWait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.latch.poll_value(cx)
    }
}
