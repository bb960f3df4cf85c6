//! # Module: metrics
//!
//! ## Responsibility
//! The point-in-time performance snapshot shared by the degradation detector,
//! the per-phase quality gates, the deployment decision, and adaptive pacing.
//!
//! ## Guarantees
//! - Non-negative: every dimension of a [`PerformanceMetrics`] built through
//!   [`PerformanceMetrics::new`] is finite and `>= 0`.
//! - Non-panicking: every ratio guards its denominator.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Dimension
// ---------------------------------------------------------------------------

/// One measured dimension of live performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Accuracy,
    Latency,
    Throughput,
    ErrorRate,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Accuracy,
        Dimension::Latency,
        Dimension::Throughput,
        Dimension::ErrorRate,
    ];

    /// `true` when a larger value is better for this dimension.
    pub fn higher_is_better(self) -> bool {
        matches!(self, Dimension::Accuracy | Dimension::Throughput)
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Dimension::Accuracy => "accuracy",
            Dimension::Latency => "latency",
            Dimension::Throughput => "throughput",
            Dimension::ErrorRate => "error_rate",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// PerformanceMetrics
// ---------------------------------------------------------------------------

/// A point-in-time snapshot of live performance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub accuracy: f64,
    pub latency: f64,
    pub throughput: f64,
    pub error_rate: f64,
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 { v } else { 0.0 }
}

impl PerformanceMetrics {
    /// Build a snapshot, mapping negative and non-finite inputs to `0.0`.
    pub fn new(accuracy: f64, latency: f64, throughput: f64, error_rate: f64) -> Self {
        Self {
            accuracy: non_negative(accuracy),
            latency: non_negative(latency),
            throughput: non_negative(throughput),
            error_rate: non_negative(error_rate),
        }
    }

    /// Re-apply the non-negativity invariant to a deserialized snapshot.
    pub fn sanitized(self) -> Self {
        Self::new(self.accuracy, self.latency, self.throughput, self.error_rate)
    }

    pub fn get(&self, dim: Dimension) -> f64 {
        match dim {
            Dimension::Accuracy => self.accuracy,
            Dimension::Latency => self.latency,
            Dimension::Throughput => self.throughput,
            Dimension::ErrorRate => self.error_rate,
        }
    }

    /// Ratio of this snapshot to `baseline` for `dim`, oriented so that
    /// values above 1.0 are better (latency and error rate are inverted).
    ///
    /// A zero denominator yields a neutral `1.0`; the result is clipped to `>= 0`.
    pub fn ratio_to(&self, baseline: &PerformanceMetrics, dim: Dimension) -> f64 {
        let (num, den) = if dim.higher_is_better() {
            (self.get(dim), baseline.get(dim))
        } else {
            (baseline.get(dim), self.get(dim))
        };
        if den == 0.0 {
            return 1.0;
        }
        let r = num / den;
        if r.is_finite() { r.max(0.0) } else { 1.0 }
    }
}

// ---------------------------------------------------------------------------
// BaselineComparison
// ---------------------------------------------------------------------------

/// Relative change of a measured snapshot against the baseline.
///
/// Every delta is oriented so that a positive value is an improvement:
/// `+0.10` accuracy means 10% more accurate, `+0.10` latency means 10% faster.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BaselineComparison {
    pub accuracy_delta: f64,
    pub latency_delta: f64,
    pub throughput_delta: f64,
    pub error_rate_delta: f64,
}

impl BaselineComparison {
    pub fn between(measured: &PerformanceMetrics, baseline: &PerformanceMetrics) -> Self {
        let delta = |dim: Dimension| -> f64 {
            let base = baseline.get(dim);
            if base == 0.0 {
                return 0.0;
            }
            let raw = (measured.get(dim) - base) / base;
            if dim.higher_is_better() { raw } else { -raw }
        };
        Self {
            accuracy_delta: delta(Dimension::Accuracy),
            latency_delta: delta(Dimension::Latency),
            throughput_delta: delta(Dimension::Throughput),
            error_rate_delta: delta(Dimension::ErrorRate),
        }
    }

    pub fn get(&self, dim: Dimension) -> f64 {
        match dim {
            Dimension::Accuracy => self.accuracy_delta,
            Dimension::Latency => self.latency_delta,
            Dimension::Throughput => self.throughput_delta,
            Dimension::ErrorRate => self.error_rate_delta,
        }
    }

    pub fn mean(&self) -> f64 {
        Dimension::ALL.iter().map(|d| self.get(*d)).sum::<f64>() / Dimension::ALL.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
