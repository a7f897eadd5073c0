//! Stats module
//!
//! Per-type and per-mode progress summaries for external consumers.
//!
//! # Overview
//!
//! Readers write their own per-type counters when a round commits. The
//! `StatsAggregator` reads those back, folds them into a `GlobalProgress`
//! per mode and persists the result under the mode-global keys.

mod aggregator;
mod types;

pub use aggregator::{aggregate, day_span, StatsAggregator};
pub use types::{GlobalProgress, TypeStats};

#[cfg(test)]
mod tests;
