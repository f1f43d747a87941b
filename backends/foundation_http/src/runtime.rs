//! Process wide initialisation.
//!
//! Engine resources ([`crate::engine::EventLoopGroup`] and everything built
//! on it) refuse construction until [`init`] has run. Both [`init`] and
//! [`shutdown`] are idempotent and may be called from any thread.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::HttpError;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Marks the runtime as initialised. Returns true when this call performed
/// the transition.
pub fn init() -> bool {
    let changed = INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::Acquire)
        .is_ok();
    if changed {
        info!("foundation_http runtime initialised");
    }
    changed
}

/// Marks the runtime as shut down. Resources already built keep working;
/// new engine resources are refused until [`init`] is called again.
pub fn shutdown() -> bool {
    let changed = INITIALIZED
        .compare_exchange(true, false, Ordering::SeqCst, Ordering::Acquire)
        .is_ok();
    if changed {
        info!("foundation_http runtime shut down");
    }
    changed
}

#[must_use]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

pub(crate) fn ensure_initialized() -> Result<(), HttpError> {
    if is_initialized() {
        Ok(())
    } else {
        Err(HttpError::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        assert!(!init());
        assert!(is_initialized());
        assert!(ensure_initialized().is_ok());
    }
}
