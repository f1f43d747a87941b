//! Test infrastructure for the `foundation_http` client.
//!
//! This crate provides:
//! - **Test HTTP server**: a scripted keep-alive HTTP/1.1 peer on localhost
//! - **Stress harness**: many threads hammering one operation, with a gauge
//!   for peak concurrency
//!
//! # Examples
//!
//! ```rust
//! use foundation_testing::stress::{ConcurrencyGauge, StressConfig, StressHarness};
//!
//! let gauge = ConcurrencyGauge::new();
//! let harness = StressHarness::new(StressConfig::new().threads(8).iterations(50));
//!
//! let inner = gauge.clone();
//! let results = harness.run(move |_thread_id, _iteration| {
//!     let _slot = inner.enter();
//!     true
//! });
//!
//! assert_eq!(results.successes, 400);
//! assert!(gauge.peak() <= 8);
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)] // Common for testing crates

pub mod http;
pub mod stress;

pub use stress::{ConcurrencyGauge, StressConfig, StressHarness, StressResult};
