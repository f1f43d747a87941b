//! Contention run settings.

use core::time::Duration;

/// How many workers hammer an operation, for how long, and whether they
/// wait for each other before the first call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressConfig {
    threads: usize,
    iterations: usize,
    time_budget: Option<Duration>,
    start_together: bool,
}

impl StressConfig {
    /// Four workers, 1000 calls each, no time budget, released together.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            threads: 4,
            iterations: 1000,
            time_budget: None,
            start_together: true,
        }
    }

    /// Number of worker threads; at least one is always spawned.
    #[must_use]
    pub const fn threads(mut self, count: usize) -> Self {
        self.threads = if count == 0 { 1 } else { count };
        self
    }

    /// Calls per worker.
    #[must_use]
    pub const fn iterations(mut self, count: usize) -> Self {
        self.iterations = count;
        self
    }

    /// Workers stop early once `budget` has elapsed.
    #[must_use]
    pub const fn time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    /// When false, workers start as soon as they are spawned instead of
    /// waiting on a shared barrier.
    #[must_use]
    pub const fn start_together(mut self, enabled: bool) -> Self {
        self.start_together = enabled;
        self
    }

    /// Worker threads a run spawns.
    #[must_use]
    pub const fn thread_count(&self) -> usize {
        self.threads
    }

    /// Calls each worker makes unless the budget runs out first.
    #[must_use]
    pub const fn iteration_count(&self) -> usize {
        self.iterations
    }

    /// Wall clock limit, if any.
    #[must_use]
    pub const fn budget(&self) -> Option<Duration> {
        self.time_budget
    }

    /// Whether workers wait on a barrier before the first call.
    #[must_use]
    pub const fn starts_together(&self) -> bool {
        self.start_together
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self::new()
    }
}
