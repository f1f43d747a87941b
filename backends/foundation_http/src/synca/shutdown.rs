use std::time::Duration;

use super::{Latch, LatchWait};

/// Handle returned by every `wait_for_shutdown()`.
pub type ShutdownWait = LatchWait<()>;

/// `ShutdownSignal` is the single-use completion every closable resource
/// carries. It fires exactly once; a second `signal()` is a defect in the
/// owner's teardown sequencing and is logged, never propagated.
#[derive(Clone)]
pub struct ShutdownSignal {
    resource: &'static str,
    latch: Latch<()>,
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("resource", &self.resource)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

impl ShutdownSignal {
    #[must_use]
    pub fn new(resource: &'static str) -> Self {
        Self {
            resource,
            latch: Latch::new(),
        }
    }

    /// Fires the signal, returning true for the first caller only.
    pub fn signal(&self) -> bool {
        if self.latch.set(()) {
            debug!(resource = self.resource, "shutdown complete");
            return true;
        }

        error!(
            resource = self.resource,
            "shutdown signaled more than once; ignoring"
        );
        false
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.latch.is_set()
    }

    /// Suspending handle; safe to obtain before or after the signal fired.
    #[must_use]
    pub fn listen(&self) -> ShutdownWait {
        self.latch.listen()
    }

    pub fn wait(&self) {
        self.latch.wait();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.latch.wait_timeout(timeout).is_some()
    }
}
