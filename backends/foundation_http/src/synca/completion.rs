//! One-shot hand-off between the engine and a waiting caller.
//!
//! A [`Completer`] is moved into whatever engine side closure will eventually
//! produce the value; the matching [`Completion`] stays with the caller, who
//! either blocks on it or awaits it. Delivery never blocks the producer.
//! Dropping an undelivered `Completer` resolves the waiter with
//! [`CompletionError::Abandoned`] so a lost callback can never hang a caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use super::lock_or_recover;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionError {
    /// The producing side was dropped without delivering a value.
    Abandoned,
    /// The wait deadline passed; the completion is still pending.
    TimedOut,
    /// The value was already taken by an earlier wait.
    Consumed,
}

impl std::error::Error for CompletionError {}

impl core::fmt::Display for CompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Abandoned => write!(f, "operation was abandoned before it completed"),
            Self::TimedOut => write!(f, "timed out waiting for completion"),
            Self::Consumed => write!(f, "completion value was already taken"),
        }
    }
}

enum Slot<T> {
    Pending,
    Ready(T),
    Abandoned,
    Taken,
}

struct SlotState<T> {
    slot: Slot<T>,
    waker: Option<Waker>,
    receiver_alive: bool,
}

struct Shared<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

/// Creates a connected completer/completion pair.
#[must_use]
pub fn channel<T>() -> (Completer<T>, Completion<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(SlotState {
            slot: Slot::Pending,
            waker: None,
            receiver_alive: true,
        }),
        ready: Condvar::new(),
    });

    (
        Completer {
            shared: shared.clone(),
        },
        Completion { shared },
    )
}

/// Producing half of a one-shot hand-off.
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> std::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("receiver_alive", &self.is_receiver_alive())
            .finish()
    }
}

impl<T> Completer<T> {
    /// Delivers `value`. When the receiving side is already gone the value is
    /// handed back so the caller can dispose of it (for example by releasing
    /// a connection back to its pool).
    ///
    /// # Errors
    ///
    /// Returns the undelivered value if the [`Completion`] was dropped.
    pub fn complete(self, value: T) -> Result<(), T> {
        let mut state = lock_or_recover(&self.shared.state);
        if !state.receiver_alive {
            return Err(value);
        }

        state.slot = Slot::Ready(value);
        let waker = state.waker.take();
        drop(state);

        self.shared.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    #[must_use]
    pub fn is_receiver_alive(&self) -> bool {
        lock_or_recover(&self.shared.state).receiver_alive
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let mut state = lock_or_recover(&self.shared.state);
        if !matches!(state.slot, Slot::Pending) {
            return;
        }

        state.slot = Slot::Abandoned;
        let waker = state.waker.take();
        drop(state);

        self.shared.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Receiving half of a one-shot hand-off.
///
/// Either block with [`Completion::wait`] / [`Completion::wait_timeout`] or
/// `.await` it; both observe the same value.
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<T> Completion<T> {
    fn take(state: &mut SlotState<T>) -> Option<Result<T, CompletionError>> {
        match std::mem::replace(&mut state.slot, Slot::Taken) {
            Slot::Ready(value) => Some(Ok(value)),
            Slot::Abandoned => {
                state.slot = Slot::Abandoned;
                Some(Err(CompletionError::Abandoned))
            }
            Slot::Taken => Some(Err(CompletionError::Consumed)),
            Slot::Pending => {
                state.slot = Slot::Pending;
                None
            }
        }
    }

    /// True once a value or an abandonment is waiting to be observed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !matches!(lock_or_recover(&self.shared.state).slot, Slot::Pending)
    }

    /// Takes the value if it is already available, without blocking.
    pub fn try_take(&mut self) -> Option<Result<T, CompletionError>> {
        let mut state = lock_or_recover(&self.shared.state);
        Self::take(&mut state)
    }

    /// Blocks the current thread until the value is delivered.
    ///
    /// # Errors
    ///
    /// [`CompletionError::Abandoned`] when the producer went away.
    pub fn wait(self) -> Result<T, CompletionError> {
        let mut state = lock_or_recover(&self.shared.state);
        loop {
            if let Some(result) = Self::take(&mut state) {
                return result;
            }
            state = match self.shared.ready.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Blocks for at most `timeout`. A [`CompletionError::TimedOut`] leaves
    /// the completion pending so it can be waited on again.
    ///
    /// # Errors
    ///
    /// [`CompletionError::TimedOut`] when the deadline passes first, or any
    /// error [`Completion::wait`] can return.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<T, CompletionError> {
        let deadline = Instant::now() + timeout;
        let mut state = lock_or_recover(&self.shared.state);
        loop {
            if let Some(result) = Self::take(&mut state) {
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CompletionError::TimedOut);
            }

            state = match self.shared.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, CompletionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock_or_recover(&self.shared.state);
        if let Some(result) = Self::take(&mut state) {
            return Poll::Ready(result);
        }

        match &state.waker {
            Some(existing) if existing.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        let mut state = lock_or_recover(&self.shared.state);
        state.receiver_alive = false;
        state.waker = None;
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::synca::block_on;

    #[test]
    fn delivers_value_across_threads() {
        let (completer, completion) = channel::<u32>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(7).expect("receiver alive");
        });

        assert_eq!(completion.wait(), Ok(7));
        handle.join().expect("should safely join");
    }

    #[test]
    fn dropped_completer_abandons_waiter() {
        let (completer, completion) = channel::<u32>();
        drop(completer);
        assert_eq!(completion.wait(), Err(CompletionError::Abandoned));
    }

    #[test]
    fn dropped_receiver_hands_value_back() {
        let (completer, completion) = channel::<String>();
        drop(completion);
        assert!(!completer.is_receiver_alive());
        assert_eq!(completer.complete("lease".into()), Err("lease".to_string()));
    }

    #[test]
    fn wait_timeout_keeps_completion_pending() {
        let (completer, mut completion) = channel::<u32>();
        assert_eq!(
            completion.wait_timeout(Duration::from_millis(10)),
            Err(CompletionError::TimedOut)
        );

        completer.complete(3).expect("receiver alive");
        assert_eq!(completion.wait_timeout(Duration::from_millis(10)), Ok(3));
        assert_eq!(completion.try_take(), Some(Err(CompletionError::Consumed)));
    }

    #[test]
    fn completion_can_be_awaited() {
        let (completer, completion) = channel::<&'static str>();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let _ = completer.complete("done");
        });

        assert_eq!(block_on(completion), Ok("done"));
    }
}
