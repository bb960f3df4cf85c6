//! # Stage: Degradation Detector
//!
//! ## Responsibility
//! Compare the current performance snapshot against the baseline and flag a
//! regression in any single dimension. The check is a per-dimension OR: one
//! regressing dimension is enough, even if every other dimension improved.
//!
//! With the default tolerance of 0.05 the rule is:
//!
//! ```text
//! current.accuracy   < baseline.accuracy   × 0.95
//! current.latency    > baseline.latency    × 1.05
//! current.throughput < baseline.throughput × 0.95
//! current.error_rate > baseline.error_rate × 1.05
//! ```
//!
//! ## NOT Responsible For
//! - Synthesizing fixes (the candidate producer does that)
//! - Storing either snapshot

use serde::{Deserialize, Serialize};

use crate::metrics::{Dimension, PerformanceMetrics};
use crate::self_modify::gate::QualityGate;

/// One dimension that crossed its bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub dimension: Dimension,
    pub current: f64,
    pub baseline: f64,
    /// The bound the current value crossed.
    pub limit: f64,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: current={:.4} baseline={:.4} limit={:.4}",
            self.dimension, self.current, self.baseline, self.limit
        )
    }
}

/// Output of one detector run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationReport {
    pub degraded: bool,
    pub violations: Vec<Violation>,
    pub current: PerformanceMetrics,
    pub baseline: PerformanceMetrics,
}

impl DegradationReport {
    pub fn violated_dimensions(&self) -> Vec<Dimension> {
        self.violations.iter().map(|v| v.dimension).collect()
    }
}

/// Flags significant regressions of current metrics against the baseline.
#[derive(Debug, Clone)]
pub struct DegradationDetector {
    bounds: QualityGate,
}

impl Default for DegradationDetector {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl DegradationDetector {
    /// `tolerance` is the allowed relative regression per dimension.
    pub fn new(tolerance: f64) -> Self {
        Self { bounds: QualityGate::with_tolerance(tolerance) }
    }

    pub fn check(&self, current: &PerformanceMetrics, baseline: &PerformanceMetrics) -> DegradationReport {
        let violations: Vec<Violation> = Dimension::ALL
            .iter()
            .filter(|&&dim| self.bounds.breaches(dim, current, baseline))
            .map(|&dim| Violation {
                dimension: dim,
                current: current.get(dim),
                baseline: baseline.get(dim),
                limit: self.bounds.limit(dim, baseline),
            })
            .collect();

        if !violations.is_empty() {
            tracing::warn!(
                target: "self_tune::degradation",
                dimensions = ?violations.iter().map(|v| v.dimension).collect::<Vec<_>>(),
                "performance degraded against baseline"
            );
        }

        DegradationReport {
            degraded: !violations.is_empty(),
            violations,
            current: *current,
            baseline: *baseline,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
