//! Stress test framework for pool and stream contention.
//!
//! Provides configurable high-contention testing with:
//! - Thread count control
//! - Iteration limits or a time budget
//! - Success rate tracking
//! - A gauge recording the peak number of concurrent holders

use core::time::Duration;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

pub mod config;

pub use config::StressConfig;

/// Counts how many holders are inside a region at once and remembers the
/// highest count seen. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    /// Creates a gauge at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the region; the returned guard leaves it on drop.
    #[must_use]
    pub fn enter(&self) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            current: Arc::clone(&self.current),
        }
    }

    /// Holders inside the region right now.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders seen.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Records an externally observed level, e.g. a pool's live count.
    pub fn observe(&self, level: usize) {
        self.peak.fetch_max(level, Ordering::SeqCst);
    }
}

/// Leaves a [`ConcurrencyGauge`] region when dropped.
#[derive(Debug)]
pub struct GaugeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressResult {
    /// Total operations completed successfully
    pub successes: usize,
    /// Total operations that failed
    pub failures: usize,
    /// Total time taken for the test
    pub duration: Duration,
    /// Number of threads used
    pub thread_count: usize,
}

impl StressResult {
    /// Creates a new stress test result.
    #[must_use]
    pub const fn new(
        successes: usize,
        failures: usize,
        duration: Duration,
        thread_count: usize,
    ) -> Self {
        Self {
            successes,
            failures,
            duration,
            thread_count,
        }
    }

    /// Returns the total number of operations.
    #[must_use]
    pub const fn total_operations(&self) -> usize {
        self.successes + self.failures
    }

    /// Returns the success rate as a value between 0.0 and 1.0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_operations() == 0 {
            0.0
        } else {
            self.successes as f64 / self.total_operations() as f64
        }
    }

    /// True when every operation succeeded.
    #[must_use]
    pub const fn all_succeeded(&self) -> bool {
        self.failures == 0 && self.successes > 0
    }
}

/// Runs one operation from many threads at once.
pub struct StressHarness {
    config: StressConfig,
}

impl StressHarness {
    /// Harness running with `config`.
    #[must_use]
    pub const fn new(config: StressConfig) -> Self {
        Self { config }
    }

    /// Calls `operation(worker, iteration)` from every worker until the
    /// iterations or the time budget run out. `true` counts as a success.
    ///
    /// ```
    /// use foundation_testing::stress::{StressConfig, StressHarness};
    ///
    /// let harness = StressHarness::new(StressConfig::new().threads(4).iterations(100));
    /// let result = harness.run(|worker, iteration| (worker + iteration) % 10 != 0);
    ///
    /// assert_eq!(result.total_operations(), 400);
    /// assert!(result.failures > 0);
    /// ```
    ///
    /// # Panics
    ///
    /// Re-raises the panic of any worker.
    pub fn run<F>(self, operation: F) -> StressResult
    where
        F: Fn(usize, usize) -> bool + Send + Sync + 'static,
    {
        let workers = self.config.thread_count();
        let iterations = self.config.iteration_count();
        let deadline = self.config.budget().map(|budget| Instant::now() + budget);
        let gate = self
            .config
            .starts_together()
            .then(|| Arc::new(Barrier::new(workers)));

        let operation = Arc::new(operation);
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let operation = Arc::clone(&operation);
                let successes = Arc::clone(&successes);
                let failures = Arc::clone(&failures);
                let gate = gate.clone();

                thread::Builder::new()
                    .name(format!("stress-worker-{worker}"))
                    .spawn(move || {
                        if let Some(gate) = gate {
                            gate.wait();
                        }
                        for iteration in 0..iterations {
                            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                                break;
                            }
                            let counter = if operation(worker, iteration) {
                                &successes
                            } else {
                                &failures
                            };
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                    .expect("spawn stress worker")
            })
            .collect();

        for handle in handles {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }

        let result = StressResult::new(
            successes.load(Ordering::Relaxed),
            failures.load(Ordering::Relaxed),
            start.elapsed(),
            workers,
        );
        tracing::debug!(
            successes = result.successes,
            failures = result.failures,
            "stress run finished"
        );
        result
    }
}
