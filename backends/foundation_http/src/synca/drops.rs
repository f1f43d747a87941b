/// `RunOnDrop` runs a function when it goes out of scope, similar to go's
/// defer. Event loop threads use it so their exit bookkeeping runs even when
/// the loop unwinds.
pub struct RunOnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> RunOnDrop<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }

    /// Consumes the guard without running the function.
    pub fn disarm(mut self) {
        self.0.take();
    }
}

impl<F: FnOnce()> Drop for RunOnDrop<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}
