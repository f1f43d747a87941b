//! Event loop threads that run all network work.
//!
//! Each loop owns a task queue, a timer heap and a wake signal. Closing the
//! group closes every queue; threads drain what was already queued, drop
//! pending timers and exit. The group's shutdown signal fires when the last
//! thread has exited.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use concurrent_queue::{ConcurrentQueue, PushError};

use crate::errors::HttpError;
use crate::runtime;
use crate::synca::{lock_or_recover, OneShotFlag, RunOnDrop, ShutdownSignal, ShutdownWait, WakeSignal};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Longest a loop sleeps when it has neither tasks nor timers.
const IDLE_PARK: Duration = Duration::from_millis(250);

struct Timer {
    deadline: Instant,
    sequence: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; reverse so the earliest deadline is on top.
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A single event loop. Obtain one through [`EventLoopGroup::next_loop`].
pub struct EventLoop {
    index: usize,
    tasks: ConcurrentQueue<Task>,
    timers: Mutex<BinaryHeap<Timer>>,
    sequence: AtomicU64,
    wake: WakeSignal,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("index", &self.index)
            .field("queued", &self.tasks.len())
            .field("closed", &self.tasks.is_closed())
            .finish()
    }
}

impl EventLoop {
    fn new(index: usize) -> Self {
        Self {
            index,
            tasks: ConcurrentQueue::unbounded(),
            timers: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            wake: WakeSignal::new(),
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tasks.is_closed()
    }

    /// Queues `task` to run on this loop. Returns false, dropping the task,
    /// when the loop is closed.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match self.tasks.push(Box::new(task)) {
            Ok(()) => {
                self.wake.notify();
                true
            }
            Err(PushError::Closed(_) | PushError::Full(_)) => false,
        }
    }

    /// Runs `task` on this loop once `delay` has passed. Returns false when
    /// the loop is closed. Timers still pending at close are dropped.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> bool {
        if self.is_closed() {
            return false;
        }

        let timer = Timer {
            deadline: Instant::now() + delay,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            task: Box::new(task),
        };
        lock_or_recover(&self.timers).push(timer);
        self.wake.notify();
        true
    }

    fn close(&self) {
        if self.tasks.close() {
            debug!(event_loop = self.index, "closing event loop");
        }
        self.wake.notify();
    }

    fn run_task(&self, task: Task) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(event_loop = self.index, "task panicked on event loop");
        }
    }

    fn expired_timers(&self, now: Instant) -> (Vec<Task>, Option<Instant>) {
        let mut timers = lock_or_recover(&self.timers);
        let mut due = Vec::new();
        while timers.peek().is_some_and(|t| t.deadline <= now) {
            if let Some(timer) = timers.pop() {
                due.push(timer.task);
            }
        }
        (due, timers.peek().map(|t| t.deadline))
    }

    fn run(&self) {
        debug!(event_loop = self.index, "event loop started");
        loop {
            let (due, next_deadline) = self.expired_timers(Instant::now());
            for task in due {
                self.run_task(task);
            }

            while let Ok(task) = self.tasks.pop() {
                self.run_task(task);
            }

            if self.tasks.is_closed() && self.tasks.is_empty() {
                break;
            }

            let park = next_deadline
                .map_or(IDLE_PARK, |deadline| {
                    deadline.saturating_duration_since(Instant::now())
                })
                .min(IDLE_PARK);
            if !park.is_zero() {
                self.wake.wait_timeout(park);
            }
        }

        let dropped = std::mem::take(&mut *lock_or_recover(&self.timers));
        debug!(
            event_loop = self.index,
            dropped_timers = dropped.len(),
            "event loop stopped"
        );
        drop(dropped);
    }
}

/// Starts one named thread running the given body.
type LoopSpawner<'a> = dyn FnMut(String, Task) -> std::io::Result<()> + 'a;

struct GroupInner {
    loops: Vec<Arc<EventLoop>>,
    next: AtomicUsize,
    /// Loop threads started and not yet exited.
    alive: Arc<AtomicUsize>,
    closed: OneShotFlag,
    shutdown: ShutdownSignal,
}

impl GroupInner {
    fn close(&self) {
        if self.closed.fire() {
            info!(threads = self.loops.len(), "closing event loop group");
            for event_loop in &self.loops {
                event_loop.close();
            }
        }
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A fixed set of event loop threads. Cloning shares the same threads; the
/// group closes itself when the last clone is dropped.
#[derive(Clone)]
pub struct EventLoopGroup {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("loops", &self.inner.loops)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EventLoopGroup {
    /// Spawns `threads` event loops; `0` picks the available parallelism.
    ///
    /// # Errors
    ///
    /// [`HttpError::NotInitialized`] before [`runtime::init`], or
    /// [`HttpError::Io`] if a thread could not be spawned.
    pub fn new(threads: usize) -> Result<Self, HttpError> {
        runtime::ensure_initialized()?;

        let threads = if threads == 0 {
            thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            threads
        };

        let group = Self::unstarted(threads);
        let mut spawn = |name: String, body: Task| {
            thread::Builder::new().name(name).spawn(body).map(drop)
        };
        if let Err(err) = group.spawn_loops(&mut spawn) {
            error!("failed to spawn event loop thread: {err}");
            group.close();
            return Err(HttpError::Io(err));
        }

        info!(threads, "event loop group started");
        Ok(group)
    }

    fn unstarted(threads: usize) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                loops: (0..threads).map(|i| Arc::new(EventLoop::new(i))).collect(),
                next: AtomicUsize::new(0),
                alive: Arc::new(AtomicUsize::new(0)),
                closed: OneShotFlag::new(),
                shutdown: ShutdownSignal::new("event loop group"),
            }),
        }
    }

    /// Starts one thread per loop. Only threads that actually started are
    /// counted, so the shutdown signal still fires after a partial start.
    fn spawn_loops(&self, spawn: &mut LoopSpawner<'_>) -> std::io::Result<()> {
        for event_loop in &self.inner.loops {
            let alive = self.inner.alive.clone();
            let shutdown = self.inner.shutdown.clone();
            let event_loop = event_loop.clone();
            let index = event_loop.index;

            self.inner.alive.fetch_add(1, Ordering::AcqRel);
            let body: Task = Box::new(move || {
                let _exit = RunOnDrop::new(move || {
                    if alive.fetch_sub(1, Ordering::AcqRel) == 1 {
                        shutdown.signal();
                    }
                });
                event_loop.run();
            });

            if let Err(err) = spawn(format!("foundation-http-loop-{index}"), body) {
                if self.inner.alive.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.inner.shutdown.signal();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.loops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.loops.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_fired()
    }

    /// Picks a loop round-robin.
    #[must_use]
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let index = self.inner.next.fetch_add(1, Ordering::Relaxed) % self.inner.loops.len();
        self.inner.loops[index].clone()
    }

    /// Stops accepting work; threads exit once their queues drain.
    pub fn close(&self) {
        self.inner.close();
    }

    #[must_use]
    pub fn wait_for_shutdown(&self) -> ShutdownWait {
        self.inner.shutdown.listen()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    fn group(threads: usize) -> EventLoopGroup {
        runtime::init();
        EventLoopGroup::new(threads).expect("event loop group")
    }

    #[test]
    fn executes_tasks_on_loop_threads() {
        let group = group(2);
        let (tx, rx) = mpsc::channel();

        for i in 0..4 {
            let tx = tx.clone();
            assert!(group.next_loop().execute(move || {
                let name = thread::current().name().map(str::to_owned);
                tx.send((i, name)).expect("send");
            }));
        }

        for _ in 0..4 {
            let (_, name) = rx.recv_timeout(Duration::from_secs(5)).expect("task ran");
            assert!(name.expect("named thread").starts_with("foundation-http-loop-"));
        }
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let group = group(1);
        let event_loop = group.next_loop();
        let (tx, rx) = mpsc::channel();

        let late = tx.clone();
        event_loop.schedule(Duration::from_millis(60), move || late.send("late").expect("send"));
        event_loop.schedule(Duration::from_millis(10), move || tx.send("early").expect("send"));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("early"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("late"));
    }

    #[test]
    fn close_signals_shutdown_and_rejects_work() {
        let group = group(2);
        let before = group.wait_for_shutdown();
        let event_loop = group.next_loop();

        group.close();
        assert!(before.wait_timeout(Duration::from_secs(5)).is_some());
        assert!(group.wait_for_shutdown().wait_timeout(Duration::from_secs(1)).is_some());
        assert!(!event_loop.execute(|| {}));
        assert!(!event_loop.schedule(Duration::ZERO, || {}));
    }

    #[test]
    fn panicking_task_does_not_stop_the_loop() {
        let group = group(1);
        let event_loop = group.next_loop();
        let (tx, rx) = mpsc::channel();

        event_loop.execute(|| panic!("boom"));
        event_loop.execute(move || tx.send(()).expect("send"));

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    /// WHY: a group that could not start every thread must still shut down.
    /// WHAT: with the second spawn failing, closing the group signals once
    /// the one started thread exits.
    #[test]
    fn partial_start_still_signals_shutdown() {
        let group = EventLoopGroup::unstarted(3);
        let waiter = group.wait_for_shutdown();

        let mut started = 0;
        let mut spawn = |name: String, body: Task| {
            if started == 1 {
                return Err(std::io::Error::other("thread limit reached"));
            }
            started += 1;
            thread::Builder::new().name(name).spawn(body).map(drop)
        };
        assert!(group.spawn_loops(&mut spawn).is_err());
        assert_eq!(group.inner.alive.load(Ordering::SeqCst), 1);
        assert!(waiter.wait_timeout(Duration::from_millis(50)).is_none());

        group.close();
        assert!(waiter.wait_timeout(Duration::from_secs(5)).is_some());
    }

    /// WHY: nothing started means nothing to wait for.
    /// WHAT: a failing first spawn signals shutdown right away.
    #[test]
    fn failed_first_spawn_signals_immediately() {
        let group = EventLoopGroup::unstarted(2);
        let mut spawn = |_: String, _: Task| -> std::io::Result<()> {
            Err(std::io::Error::other("thread limit reached"))
        };
        assert!(group.spawn_loops(&mut spawn).is_err());
        assert!(group
            .wait_for_shutdown()
            .wait_timeout(Duration::from_millis(10))
            .is_some());
    }

    #[test]
    fn dropping_last_handle_closes_the_group() {
        let waiter = {
            let group = group(1);
            group.wait_for_shutdown()
        };
        assert!(waiter.wait_timeout(Duration::from_secs(5)).is_some());
    }
}
