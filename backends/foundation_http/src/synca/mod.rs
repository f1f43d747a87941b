//! Synchronisation primitives shared by the engine and the pool.

mod completion;
mod dependents;
mod drops;
mod event;
mod latch;
mod shutdown;
mod signals;

pub use completion::*;
pub use dependents::*;
pub use drops::*;
pub use event::*;
pub use latch::*;
pub use shutdown::*;
pub use signals::*;

use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

/// Locks `mutex`, recovering the guard if a panicking holder poisoned it.
///
/// Every guarded structure in this crate is left consistent between
/// statements, so continuing after a poisoned lock is sound.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Drives `future` to completion on the current thread, parking between polls.
///
/// Meant for callers without an async runtime who still want to use the
/// `Future` side of the suspending handles.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => thread::park(),
        }
    }
}
