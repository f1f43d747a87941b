use std::time::{Duration, Instant};

use crate::http::MonitoringOptions;

/// Throughput is sampled over windows of this length.
const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Tracks read throughput of one connection while an exchange is in flight.
///
/// Each elapsed sample period is compared with the configured minimum; the
/// connection turns unhealthy once samples stayed below it for longer than
/// the allowable interval.
#[derive(Debug)]
pub(crate) struct ThroughputMonitor {
    minimum_bytes_per_second: u64,
    allowable_interval: Duration,
    sample_start: Instant,
    sample_bytes: u64,
    failing_since: Option<Instant>,
}

impl ThroughputMonitor {
    pub(crate) fn new(options: &MonitoringOptions, now: Instant) -> Self {
        Self {
            minimum_bytes_per_second: options.minimum_throughput_bytes_per_second(),
            allowable_interval: options.allowable_throughput_failure_interval(),
            sample_start: now,
            sample_bytes: 0,
            failing_since: None,
        }
    }

    pub(crate) fn record(&mut self, bytes: usize) {
        self.sample_bytes += bytes as u64;
    }

    /// Restarts measuring, used when an exchange starts or when the consumer
    /// paused delivery.
    pub(crate) fn reset(&mut self, now: Instant) {
        self.sample_start = now;
        self.sample_bytes = 0;
        self.failing_since = None;
    }

    /// Closes the current sample if it is due and reports whether the
    /// connection is now unhealthy.
    pub(crate) fn check(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.sample_start);
        if elapsed < SAMPLE_PERIOD {
            return false;
        }

        let per_second = (u128::from(self.sample_bytes) * 1000) / elapsed.as_millis().max(1);
        let below = per_second < u128::from(self.minimum_bytes_per_second);

        if below {
            let since = *self.failing_since.get_or_insert(self.sample_start);
            if now.saturating_duration_since(since) > self.allowable_interval {
                return true;
            }
        } else {
            self.failing_since = None;
        }

        self.sample_start = now;
        self.sample_bytes = 0;
        false
    }
}
