//! # Stage: Decision & Quality Gates
//!
//! ## Responsibility
//! Two gates stand between a tested improvement and live traffic:
//!
//! 1. The **deployment decision**: a pure AND of five criteria over the
//!    improvement's test results, risk and confidence. Any single failure
//!    rejects the candidate.
//! 2. The per-phase **quality gate**: bounds on live metrics relative to the
//!    baseline that must hold before a rollout phase may advance.
//!
//! ## Guarantees
//! - Pure: both gates are deterministic functions of their inputs.
//! - Auditable: every run returns a report with one entry per criterion /
//!   dimension, including the observed value and the limit it was held to.

use serde::{Deserialize, Serialize};

use crate::improvement::{Improvement, TestResults};
use crate::metrics::{Dimension, PerformanceMetrics};

// ---------------------------------------------------------------------------
// Check result types
// ---------------------------------------------------------------------------

/// The outcome of a single check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CheckStatus {
    Passed,
    Failed { reason: String },
}

impl CheckStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, CheckStatus::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CheckStatus::Failed { .. })
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Passed => write!(f, "PASS"),
            CheckStatus::Failed { reason } => write!(f, "FAIL: {}", reason),
        }
    }
}

/// Result of one named check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub observed: f64,
    pub limit: f64,
}

impl CheckResult {
    fn evaluate(name: impl Into<String>, observed: f64, limit: f64, ok: bool, op: &str) -> Self {
        let name = name.into();
        let status = if ok {
            CheckStatus::Passed
        } else {
            CheckStatus::Failed {
                reason: format!("{name} {observed:.4} must be {op} {limit:.4}"),
            }
        };
        Self { name, status, observed, limit }
    }
}

// ---------------------------------------------------------------------------
// Deployment decision
// ---------------------------------------------------------------------------

/// One of the five deployment-decision criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    OverallImprovement,
    Reliability,
    Efficiency,
    RiskLevel,
    Confidence,
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Criterion::OverallImprovement => "overall_improvement",
            Criterion::Reliability => "reliability",
            Criterion::Efficiency => "efficiency",
            Criterion::RiskLevel => "risk_level",
            Criterion::Confidence => "confidence",
        };
        write!(f, "{s}")
    }
}

/// Thresholds for the deployment decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionCriteria {
    /// `overall_improvement` must exceed this (default 0.05).
    pub min_overall_improvement: f64,
    /// `reliability` must exceed this (default 0.95).
    pub min_reliability: f64,
    /// `efficiency` must be at least this (default 1.0).
    pub min_efficiency: f64,
    /// `risk_level` must be below this (default 0.3).
    pub max_risk: f64,
    /// `confidence` must exceed this (default 0.8).
    pub min_confidence: f64,
}

impl Default for DecisionCriteria {
    fn default() -> Self {
        Self {
            min_overall_improvement: 0.05,
            min_reliability: 0.95,
            min_efficiency: 1.0,
            max_risk: 0.3,
            min_confidence: 0.8,
        }
    }
}

/// Per-criterion entry of a [`DecisionReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionCheck {
    pub criterion: Criterion,
    pub check: CheckResult,
}

/// The complete output of one deployment decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionReport {
    pub checks: Vec<CriterionCheck>,
    /// `true` iff every criterion passed.
    pub accepted: bool,
}

impl DecisionReport {
    pub fn failed_criteria(&self) -> Vec<Criterion> {
        self.checks
            .iter()
            .filter(|c| c.check.status.is_failed())
            .map(|c| c.criterion)
            .collect()
    }

    /// Human-readable rejection reason, `None` when accepted.
    pub fn rejection_reason(&self) -> Option<String> {
        if self.accepted {
            return None;
        }
        let reasons: Vec<String> = self
            .checks
            .iter()
            .filter_map(|c| match &c.check.status {
                CheckStatus::Failed { reason } => Some(reason.clone()),
                CheckStatus::Passed => None,
            })
            .collect();
        Some(reasons.join("; "))
    }
}

impl DecisionCriteria {
    /// Decide whether `improvement` may enter phased rollout given `results`.
    pub fn evaluate(&self, improvement: &Improvement, results: &TestResults) -> DecisionReport {
        let overall = results.performance.overall_improvement;
        let reliability = results.stability.reliability;
        let efficiency = results.resources.efficiency;
        let risk = improvement.risk_level();
        let confidence = improvement.confidence();

        let checks = vec![
            CriterionCheck {
                criterion: Criterion::OverallImprovement,
                check: CheckResult::evaluate(
                    "overall_improvement",
                    overall,
                    self.min_overall_improvement,
                    overall > self.min_overall_improvement,
                    ">",
                ),
            },
            CriterionCheck {
                criterion: Criterion::Reliability,
                check: CheckResult::evaluate(
                    "reliability",
                    reliability,
                    self.min_reliability,
                    reliability > self.min_reliability,
                    ">",
                ),
            },
            CriterionCheck {
                criterion: Criterion::Efficiency,
                check: CheckResult::evaluate(
                    "efficiency",
                    efficiency,
                    self.min_efficiency,
                    efficiency >= self.min_efficiency,
                    ">=",
                ),
            },
            CriterionCheck {
                criterion: Criterion::RiskLevel,
                check: CheckResult::evaluate("risk_level", risk, self.max_risk, risk < self.max_risk, "<"),
            },
            CriterionCheck {
                criterion: Criterion::Confidence,
                check: CheckResult::evaluate(
                    "confidence",
                    confidence,
                    self.min_confidence,
                    confidence > self.min_confidence,
                    ">",
                ),
            },
        ];

        let accepted = checks.iter().all(|c| c.check.status.is_passed());
        DecisionReport { checks, accepted }
    }
}

// ---------------------------------------------------------------------------
// QualityGate
// ---------------------------------------------------------------------------

/// Live-metric bounds for one rollout phase, as ratios of the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGate {
    /// `accuracy >= baseline.accuracy × min_accuracy_ratio`
    pub min_accuracy_ratio: f64,
    /// `latency <= baseline.latency × max_latency_ratio`
    pub max_latency_ratio: f64,
    /// `throughput >= baseline.throughput × min_throughput_ratio`
    pub min_throughput_ratio: f64,
    /// `error_rate <= baseline.error_rate × max_error_rate_ratio`
    pub max_error_rate_ratio: f64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::with_tolerance(0.05)
    }
}

/// Result of evaluating a [`QualityGate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub checks: Vec<CheckResult>,
    pub passed: bool,
}

impl GateReport {
    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| c.status.is_failed()).collect()
    }

    pub fn failure_reason(&self) -> Option<String> {
        if self.passed {
            return None;
        }
        let reasons: Vec<String> = self.failed_checks().iter().map(|c| c.status.to_string()).collect();
        Some(reasons.join("; "))
    }
}

impl QualityGate {
    /// Symmetric bounds: every dimension may regress by at most `tolerance`.
    pub fn with_tolerance(tolerance: f64) -> Self {
        Self {
            min_accuracy_ratio: 1.0 - tolerance,
            max_latency_ratio: 1.0 + tolerance,
            min_throughput_ratio: 1.0 - tolerance,
            max_error_rate_ratio: 1.0 + tolerance,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("min_accuracy_ratio", self.min_accuracy_ratio),
            ("max_latency_ratio", self.max_latency_ratio),
            ("min_throughput_ratio", self.min_throughput_ratio),
            ("max_error_rate_ratio", self.max_error_rate_ratio),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("gate.{name} must be finite and non-negative, got {v}"));
            }
        }
        Ok(())
    }

    /// The bound `dim` is held to, expressed in absolute units.
    pub fn limit(&self, dim: Dimension, baseline: &PerformanceMetrics) -> f64 {
        let ratio = match dim {
            Dimension::Accuracy => self.min_accuracy_ratio,
            Dimension::Latency => self.max_latency_ratio,
            Dimension::Throughput => self.min_throughput_ratio,
            Dimension::ErrorRate => self.max_error_rate_ratio,
        };
        baseline.get(dim) * ratio
    }

    /// `true` when `observed` breaches the bound for `dim`.
    pub fn breaches(&self, dim: Dimension, observed: &PerformanceMetrics, baseline: &PerformanceMetrics) -> bool {
        let limit = self.limit(dim, baseline);
        let v = observed.get(dim);
        if dim.higher_is_better() { v < limit } else { v > limit }
    }

    pub fn evaluate(&self, observed: &PerformanceMetrics, baseline: &PerformanceMetrics) -> GateReport {
        let checks: Vec<CheckResult> = Dimension::ALL
            .iter()
            .map(|&dim| {
                let op = if dim.higher_is_better() { ">=" } else { "<=" };
                CheckResult::evaluate(
                    dim.to_string(),
                    observed.get(dim),
                    self.limit(dim, baseline),
                    !self.breaches(dim, observed, baseline),
                    op,
                )
            })
            .collect();
        let passed = checks.iter().all(|c| c.status.is_passed());
        GateReport { checks, passed }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::improvement::{Category, PerformanceResults, ResourceResults, StabilityResults};
    use crate::metrics::BaselineComparison;
    use rstest::rstest;

    fn results(overall: f64, reliability: f64, efficiency: f64) -> TestResults {
        TestResults {
            performance: PerformanceResults {
                metrics: PerformanceMetrics::new(0.95, 90.0, 55.0, 0.01),
                overall_improvement: overall,
            },
            stability: StabilityResults { reliability },
            resources: ResourceResults { efficiency },
            comparison: BaselineComparison::default(),
            duration_ms: 10,
        }
    }

    fn candidate(confidence: f64, risk: f64) -> Improvement {
        Improvement::new(Category::Architecture, "wider layer", confidence, 0.08, risk)
    }

    fn baseline() -> PerformanceMetrics {
        PerformanceMetrics::new(1.0, 100.0, 50.0, 0.01)
    }

    // -----------------------------------------------------------------------
    // Deployment decision
    // -----------------------------------------------------------------------

    #[test]
    fn reference_candidate_is_accepted() {
        let report = DecisionCriteria::default().evaluate(&candidate(0.9, 0.1), &results(0.08, 0.97, 1.0));
        assert!(report.accepted);
        assert!(report.failed_criteria().is_empty());
        assert!(report.rejection_reason().is_none());
        assert_eq!(report.checks.len(), 5);
    }

    #[test]
    fn low_confidence_is_rejected_naming_confidence() {
        let report = DecisionCriteria::default().evaluate(&candidate(0.5, 0.1), &results(0.08, 0.97, 1.0));
        assert!(!report.accepted);
        assert_eq!(report.failed_criteria(), vec![Criterion::Confidence]);
        assert!(report.rejection_reason().unwrap().contains("confidence"));
    }

    #[rstest]
    #[case::gain_at_threshold(0.05, 0.97, 1.0, 0.9, 0.1, Criterion::OverallImprovement)]
    #[case::reliability_at_threshold(0.08, 0.95, 1.0, 0.9, 0.1, Criterion::Reliability)]
    #[case::resource_regression(0.08, 0.97, 0.99, 0.9, 0.1, Criterion::Efficiency)]
    #[case::risk_at_threshold(0.08, 0.97, 1.0, 0.9, 0.3, Criterion::RiskLevel)]
    #[case::confidence_at_threshold(0.08, 0.97, 1.0, 0.8, 0.1, Criterion::Confidence)]
    fn each_criterion_rejects_alone(
        #[case] overall: f64,
        #[case] reliability: f64,
        #[case] efficiency: f64,
        #[case] confidence: f64,
        #[case] risk: f64,
        #[case] expected: Criterion,
    ) {
        let report = DecisionCriteria::default()
            .evaluate(&candidate(confidence, risk), &results(overall, reliability, efficiency));
        assert!(!report.accepted);
        assert_eq!(report.failed_criteria(), vec![expected]);
        assert!(report.rejection_reason().unwrap().contains(&expected.to_string()));
    }

    #[test]
    fn multiple_failures_are_all_reported() {
        let report = DecisionCriteria::default().evaluate(&candidate(0.1, 0.9), &results(0.0, 0.5, 0.5));
        assert_eq!(report.failed_criteria().len(), 5);
    }

    #[test]
    fn decision_is_deterministic() {
        let c = candidate(0.85, 0.2);
        let r = results(0.06, 0.96, 1.1);
        let a = DecisionCriteria::default().evaluate(&c, &r);
        let b = DecisionCriteria::default().evaluate(&c, &r);
        assert_eq!(a, b);
    }

    #[test]
    fn efficiency_exactly_one_passes() {
        let report = DecisionCriteria::default().evaluate(&candidate(0.9, 0.1), &results(0.08, 0.97, 1.0));
        let eff = report.checks.iter().find(|c| c.criterion == Criterion::Efficiency).unwrap();
        assert!(eff.check.status.is_passed());
    }

    // -----------------------------------------------------------------------
    // QualityGate
    // -----------------------------------------------------------------------

    #[test]
    fn gate_passes_on_baseline() {
        let report = QualityGate::with_tolerance(0.05).evaluate(&baseline(), &baseline());
        assert!(report.passed);
        assert_eq!(report.checks.len(), 4);
    }

    #[test]
    fn gate_fails_on_latency_regression() {
        let observed = PerformanceMetrics::new(1.0, 120.0, 50.0, 0.01);
        let report = QualityGate::with_tolerance(0.05).evaluate(&observed, &baseline());
        assert!(!report.passed);
        let failed = report.failed_checks();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "latency");
        assert!(report.failure_reason().unwrap().contains("latency"));
    }

    #[test]
    fn gate_tolerates_improvement_in_every_dimension() {
        let observed = PerformanceMetrics::new(1.2, 50.0, 80.0, 0.001);
        assert!(QualityGate::with_tolerance(0.0).evaluate(&observed, &baseline()).passed);
    }

    #[test]
    fn gate_limits_are_absolute() {
        let g = QualityGate::with_tolerance(0.1);
        assert!((g.limit(Dimension::Latency, &baseline()) - 110.0).abs() < 1e-9);
        assert!((g.limit(Dimension::Throughput, &baseline()) - 45.0).abs() < 1e-9);
    }

    #[test]
    fn gate_validate_rejects_negative_ratio() {
        let g = QualityGate { min_accuracy_ratio: -1.0, ..QualityGate::default() };
        assert!(g.validate().is_err());
        assert!(QualityGate::default().validate().is_ok());
    }

    #[test]
    fn check_status_display() {
        assert_eq!(CheckStatus::Passed.to_string(), "PASS");
        let f = CheckStatus::Failed { reason: "x".into() };
        assert_eq!(f.to_string(), "FAIL: x");
    }
}
