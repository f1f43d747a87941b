//! Dependent counting for closable resources.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::OneShotFlag;

/// Tracks the dependents holding a closable resource.
///
/// Closing only stops new dependents from joining; the teardown passed to
/// [`Dependents::close`] or [`Dependents::release`] runs exactly once, when
/// the resource is closing and the last dependent let go.
#[derive(Debug, Default)]
pub struct Dependents {
    holds: AtomicUsize,
    closing: OneShotFlag,
    torn_down: OneShotFlag,
}

impl Dependents {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            holds: AtomicUsize::new(0),
            closing: OneShotFlag::new(),
            torn_down: OneShotFlag::new(),
        }
    }

    /// Registers a dependent. Returns false, holding nothing, once closing.
    pub fn acquire(&self, teardown: impl FnOnce()) -> bool {
        self.holds.fetch_add(1, Ordering::SeqCst);
        if self.closing.is_fired() {
            self.release(teardown);
            return false;
        }
        true
    }

    /// Drops one dependent registered through [`Dependents::acquire`].
    pub fn release(&self, teardown: impl FnOnce()) {
        if self.holds.fetch_sub(1, Ordering::SeqCst) == 1 && self.closing.is_fired() {
            self.finish(teardown);
        }
    }

    /// Stops admitting dependents; tears down now if none are left.
    /// Returns false when already closing.
    pub fn close(&self, teardown: impl FnOnce()) -> bool {
        if !self.closing.fire() {
            return false;
        }
        if self.holds.load(Ordering::SeqCst) == 0 {
            self.finish(teardown);
        }
        true
    }

    fn finish(&self, teardown: impl FnOnce()) {
        if self.torn_down.fire() {
            teardown();
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.holds.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.is_fired()
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.is_fired()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::Dependents;

    #[test]
    fn teardown_waits_for_the_last_dependent() {
        let dependents = Dependents::new();
        let runs = Cell::new(0);
        let teardown = || runs.set(runs.get() + 1);

        assert!(dependents.acquire(teardown));
        assert!(dependents.acquire(teardown));
        assert!(dependents.close(teardown));
        assert!(!dependents.close(teardown));
        assert!(!dependents.acquire(teardown));
        assert_eq!(runs.get(), 0);

        dependents.release(teardown);
        assert_eq!(runs.get(), 0);
        dependents.release(teardown);
        assert_eq!(runs.get(), 1);
        assert!(dependents.is_torn_down());
    }

    #[test]
    fn close_without_dependents_tears_down_at_once() {
        let dependents = Dependents::new();
        let runs = Cell::new(0);
        assert!(dependents.close(|| runs.set(runs.get() + 1)));
        assert_eq!(runs.get(), 1);
        assert_eq!(dependents.count(), 0);
    }
}
