//! # Stage: Adaptive Pacing
//!
//! ## Responsibility
//! Decide how long the loop sleeps between iterations. A growing backlog or
//! healthy live performance shortens the wait:
//!
//! ```text
//! backlog     = min(queue_len / saturation, 1)
//! interval    = base × (1 − 0.5·backlog) × (1 − 0.3·performance)
//! clamped to  [min, max]
//! ```
//!
//! `performance` is the mean of the four oriented current/baseline ratios
//! (accuracy, 1/latency, throughput, 1/error_rate), clamped to `[0, 1]`.
//!
//! ## Guarantees
//! - The returned interval always lies in `[min, max]`.
//! - Pure: no clock reads; callers supply the inputs.

use std::time::Duration;

use crate::config::{secs, TimingConfig};
use crate::metrics::{Dimension, PerformanceMetrics};

/// Performance factor in `[0, 1]` used by [`AdaptiveInterval::next`].
pub fn performance_factor(current: &PerformanceMetrics, baseline: &PerformanceMetrics) -> f64 {
    let sum: f64 = Dimension::ALL.iter().map(|&d| current.ratio_to(baseline, d)).sum();
    let mean = sum / Dimension::ALL.len() as f64;
    if mean.is_nan() { 0.0 } else { mean.clamp(0.0, 1.0) }
}

/// Interval policy derived from [`TimingConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveInterval {
    base_secs: f64,
    min_secs: f64,
    max_secs: f64,
    backlog_saturation: usize,
    max_backlog_reduction: f64,
    max_performance_reduction: f64,
}

impl Default for AdaptiveInterval {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for AdaptiveInterval {
    fn from(t: &TimingConfig) -> Self {
        Self {
            base_secs: t.base_interval_secs,
            min_secs: t.min_interval_secs,
            max_secs: t.max_interval_secs.max(t.min_interval_secs),
            backlog_saturation: t.backlog_saturation.max(1),
            max_backlog_reduction: t.max_backlog_reduction,
            max_performance_reduction: t.max_performance_reduction,
        }
    }
}

impl AdaptiveInterval {
    pub fn next(&self, queue_len: usize, performance: f64) -> Duration {
        let backlog = (queue_len as f64 / self.backlog_saturation as f64).min(1.0);
        let performance = if performance.is_nan() { 0.0 } else { performance.clamp(0.0, 1.0) };
        let raw = self.base_secs
            * (1.0 - self.max_backlog_reduction * backlog)
            * (1.0 - self.max_performance_reduction * performance);
        secs(raw.clamp(self.min_secs, self.max_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
