// Implements a wake notification primitive used to park event loop threads.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::lock_or_recover;

/// `WakeState` is the state guarded by a [`WakeSignal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeState {
    /// Nothing has asked the owner to wake up.
    Idle,
    /// A notification arrived and has not been consumed yet.
    Notified,
}

/// `WakeSignal` lets a thread sleep without burning CPU until another thread
/// notifies it or a deadline passes.
///
/// Notifications are sticky: a notify that lands while the owner is busy is
/// remembered and consumed by the next wait, so wake-ups are never lost.
pub struct WakeSignal {
    event: Condvar,
    state: Mutex<WakeState>,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WakeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeSignal")
            .field("state", &self.probe())
            .finish()
    }
}

impl WakeSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            event: Condvar::new(),
            state: Mutex::new(WakeState::Idle),
        }
    }

    pub fn probe(&self) -> WakeState {
        *lock_or_recover(&self.state)
    }

    /// Marks the signal as notified and wakes one sleeper.
    pub fn notify(&self) {
        let mut state = lock_or_recover(&self.state);
        *state = WakeState::Notified;
        drop(state);
        self.event.notify_one();
    }

    /// Blocks until notified or until `timeout` elapses, consuming any
    /// pending notification. Returns true when woken by a notification.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = lock_or_recover(&self.state);
        if *state == WakeState::Idle {
            state = match self.event.wait_timeout(state, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        let notified = *state == WakeState::Notified;
        *state = WakeState::Idle;
        notified
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{WakeSignal, WakeState};

    #[test]
    fn notify_before_wait_is_not_lost() {
        let signal = WakeSignal::new();
        signal.notify();
        assert_eq!(WakeState::Notified, signal.probe());

        let started = Instant::now();
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(WakeState::Idle, signal.probe());
    }

    #[test]
    fn wait_times_out_without_notification() {
        let signal = WakeSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn notify_from_other_thread_wakes_sleeper() {
        let signal = Arc::new(WakeSignal::new());

        let sleeper = signal.clone();
        let handle = thread::spawn(move || sleeper.wait_timeout(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(50));
        signal.notify();

        assert!(handle.join().expect("should safely join"));
    }
}
