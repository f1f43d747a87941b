use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Indicates the underlying flag has fired.
const FIRED: usize = 1;

/// Indicates the underlying flag has not fired yet.
const ARMED: usize = 0;

/// `OneShotFlag` flips from armed to fired exactly once.
///
/// Only the caller that performs the flip observes `true` from [`Self::fire`],
/// which makes it the guard for idempotent operations such as releasing a
/// lease or signaling a shutdown.
#[derive(Debug)]
pub struct OneShotFlag {
    state: AtomicUsize,
}

impl Default for OneShotFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShotFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(ARMED),
        }
    }

    /// `fire` flips the flag, returning true only for the first caller.
    #[inline]
    pub fn fire(&self) -> bool {
        self.state
            .compare_exchange(ARMED, FIRED, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// `is_fired` returns true once any caller fired the flag.
    #[inline]
    pub fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

/// `StateCell` stores a monotonic state machine in a single atomic.
///
/// States are ordered by their `u8` representation and a cell only ever
/// moves forward: [`Self::advance`] refuses to go back to an earlier or equal
/// state, [`Self::transition`] only succeeds from one exact state.
#[derive(Debug)]
pub struct StateCell<S> {
    state: AtomicU8,
    _marker: std::marker::PhantomData<S>,
}

impl<S> StateCell<S>
where
    S: Copy + Into<u8> + From<u8>,
{
    pub fn new(initial: S) -> Self {
        Self {
            state: AtomicU8::new(initial.into()),
            _marker: std::marker::PhantomData,
        }
    }

    #[inline]
    pub fn get(&self) -> S {
        S::from(self.state.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`, failing with the observed state otherwise.
    pub fn transition(&self, from: S, to: S) -> Result<(), S> {
        self.state
            .compare_exchange(from.into(), to.into(), Ordering::SeqCst, Ordering::Acquire)
            .map(|_| ())
            .map_err(S::from)
    }

    /// Moves forward to `to` if the current state is earlier, returning the
    /// state observed before the call.
    pub fn advance(&self, to: S) -> Result<S, S> {
        let target = to.into();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= target {
                return Err(S::from(current));
            }
            match self.state.compare_exchange_weak(
                current,
                target,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(previous) => return Ok(S::from(previous)),
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Start,
        Middle,
        End,
    }

    impl From<Phase> for u8 {
        fn from(value: Phase) -> Self {
            value as u8
        }
    }

    impl From<u8> for Phase {
        fn from(value: u8) -> Self {
            match value {
                0 => Phase::Start,
                1 => Phase::Middle,
                _ => Phase::End,
            }
        }
    }

    #[test]
    fn one_shot_flag_fires_once() {
        let flag = OneShotFlag::new();
        assert!(!flag.is_fired());
        assert!(flag.fire());
        assert!(!flag.fire());
        assert!(flag.is_fired());
    }

    #[test]
    fn state_cell_never_moves_backwards() {
        let cell = StateCell::new(Phase::Start);
        assert_eq!(cell.advance(Phase::End), Ok(Phase::Start));
        assert_eq!(cell.advance(Phase::Middle), Err(Phase::End));
        assert_eq!(cell.get(), Phase::End);
    }

    #[test]
    fn state_cell_transition_requires_exact_source() {
        let cell = StateCell::new(Phase::Start);
        assert_eq!(cell.transition(Phase::Middle, Phase::End), Err(Phase::Start));
        assert_eq!(cell.transition(Phase::Start, Phase::Middle), Ok(()));
        assert_eq!(cell.get(), Phase::Middle);
    }
}
