//! Stream side view of the response flow-control window.

/// Tracks how many response bytes a stream has granted but not yet been
/// delivered.
///
/// In manual mode the window starts at the configured size, shrinks by every
/// delivered byte and grows by every increment. Without manual management
/// the window is unbounded and increments are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowWindow {
    available: Option<u64>,
}

impl FlowWindow {
    #[must_use]
    pub fn manual(initial: u64) -> Self {
        Self {
            available: Some(initial),
        }
    }

    #[must_use]
    pub fn unbounded() -> Self {
        Self { available: None }
    }

    #[must_use]
    pub fn is_manual(&self) -> bool {
        self.available.is_some()
    }

    /// Bytes that may still be delivered; `None` when unbounded.
    #[must_use]
    pub fn available(&self) -> Option<u64> {
        self.available
    }

    /// Accounts for `amount` delivered bytes. Saturates at zero; the engine
    /// never delivers past the window.
    pub fn consume(&mut self, amount: u64) {
        if let Some(available) = self.available.as_mut() {
            debug_assert!(amount <= *available, "delivered past the window");
            *available = available.saturating_sub(amount);
        }
    }

    /// Widens the window. Returns false when there is no window to widen.
    pub fn increase(&mut self, increment: u64) -> bool {
        match self.available.as_mut() {
            Some(available) => {
                *available = available.saturating_add(increment);
                true
            }
            None => false,
        }
    }
}
