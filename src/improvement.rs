//! # Module: improvement
//!
//! ## Responsibility
//! The candidate-change record tracked through its own lifecycle, and the
//! state machine that governs its `status`.
//!
//! ```text
//! Pending ──► Testing ──► Phase(0) ──► … ──► Phase(n-1) ──► Deployed
//!    │           │            │                  │             │
//!    └──► Failed ◄┘            └──► RolledBack ◄──┘◄────────────┤ (manual)
//!                              └──► Failed ◄──────────────────────┘ (rollback unverified)
//! ```
//!
//! ## Guarantees
//! - `confidence` and `risk_level` are always in `[0, 1]`.
//! - `status` only changes through [`Improvement::transition`], which rejects
//!   every edge not drawn above. `Failed` and `RolledBack` have no outgoing edges.
//! - `test_results` is write-once.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LoopError, Result};
use crate::metrics::{BaselineComparison, PerformanceMetrics};
use crate::now_ms;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// The kind of change an improvement makes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Category {
    FeatureEngineering,
    Architecture,
    Hyperparameters,
    Ensemble,
    DataAugmentation,
    LossFunction,
    Regularization,
    Activation,
    /// Any category outside the built-in set.
    Custom(String),
}

impl Category {
    /// The built-in categories, in discovery order.
    pub const BUILTIN: [Category; 8] = [
        Category::FeatureEngineering,
        Category::Architecture,
        Category::Hyperparameters,
        Category::Ensemble,
        Category::DataAugmentation,
        Category::LossFunction,
        Category::Regularization,
        Category::Activation,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Category::FeatureEngineering => "feature-engineering",
            Category::Architecture => "architecture",
            Category::Hyperparameters => "hyperparameters",
            Category::Ensemble => "ensemble",
            Category::DataAugmentation => "data-augmentation",
            Category::LossFunction => "loss-function",
            Category::Regularization => "regularization",
            Category::Activation => "activation",
            Category::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        Category::BUILTIN
            .iter()
            .find(|c| c.as_str() == s)
            .cloned()
            .unwrap_or_else(|| Category::Custom(s.to_string()))
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        Category::from(s.as_str())
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Why an improvement was discovered. Determines its queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Routine discovery across categories.
    Routine,
    /// Synthesized in response to detected degradation.
    Urgent,
    /// Derived from user feedback.
    Feedback,
}

impl Origin {
    pub fn multiplier(self) -> f64 {
        match self {
            Origin::Routine => 1.0,
            Origin::Urgent => 2.0,
            Origin::Feedback => 1.5,
        }
    }

    /// Queue priority for an improvement of this origin with `expected_gain`.
    pub fn priority(self, expected_gain: f64) -> f64 {
        expected_gain * self.multiplier()
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Routine => write!(f, "routine"),
            Origin::Urgent => write!(f, "urgent"),
            Origin::Feedback => write!(f, "feedback"),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of an improvement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    Pending,
    Testing,
    /// Inside rollout phase `index` of the deployment plan.
    Phase { index: usize, name: String },
    Deployed,
    RolledBack,
    Failed,
}

/// Status without the phase payload, for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Pending,
    Testing,
    RollingOut,
    Deployed,
    RolledBack,
    Failed,
}

impl Status {
    pub fn kind(&self) -> StatusKind {
        match self {
            Status::Pending => StatusKind::Pending,
            Status::Testing => StatusKind::Testing,
            Status::Phase { .. } => StatusKind::RollingOut,
            Status::Deployed => StatusKind::Deployed,
            Status::RolledBack => StatusKind::RolledBack,
            Status::Failed => StatusKind::Failed,
        }
    }

    /// `true` for states with no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::RolledBack | Status::Failed)
    }

    /// `true` once the lifecycle has produced an outcome worth recording.
    pub fn is_settled(&self) -> bool {
        matches!(self, Status::Deployed | Status::RolledBack | Status::Failed)
    }

    pub fn can_transition_to(&self, next: &Status) -> bool {
        match (self, next) {
            (Status::Pending, Status::Testing | Status::Failed) => true,
            (Status::Testing, Status::Phase { index: 0, .. }) => true,
            (Status::Testing, Status::Failed) => true,
            (Status::Phase { index: i, .. }, Status::Phase { index: j, .. }) => *j == i + 1,
            (Status::Phase { .. }, Status::Deployed | Status::RolledBack | Status::Failed) => true,
            (Status::Deployed, Status::RolledBack | Status::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Testing => write!(f, "testing"),
            Status::Phase { name, .. } => write!(f, "{name}"),
            Status::Deployed => write!(f, "deployed"),
            Status::RolledBack => write!(f, "rolled_back"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// TestResults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceResults {
    pub metrics: PerformanceMetrics,
    /// Fractional overall gain against the baseline (0.08 = 8%).
    pub overall_improvement: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityResults {
    /// Fraction of the suite that behaved reliably, in `[0, 1]`.
    pub reliability: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceResults {
    /// Baseline resource cost divided by candidate cost; `>= 1.0` means no regression.
    pub efficiency: f64,
}

/// Everything the test harness measured for one improvement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub performance: PerformanceResults,
    pub stability: StabilityResults,
    pub resources: ResourceResults,
    pub comparison: BaselineComparison,
    pub duration_ms: u64,
}

impl TestResults {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

// ---------------------------------------------------------------------------
// Improvement
// ---------------------------------------------------------------------------

fn unit_interval(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// A candidate change, tracked through its own lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    id: String,
    category: Category,
    description: String,
    confidence: f64,
    expected_gain: f64,
    risk_level: f64,
    origin: Origin,
    status: Status,
    test_results: Option<TestResults>,
    created_at_ms: u64,
    deployed_at_ms: Option<u64>,
    /// Human-readable reason for the terminal outcome.
    outcome_reason: Option<String>,
    /// Rollout phase that was active when the rollout stopped.
    failed_phase: Option<String>,
}

impl Improvement {
    /// Create a routine, pending improvement with a fresh UUID.
    ///
    /// `confidence` and `risk_level` are clamped into `[0, 1]`; NaN becomes 0.
    pub fn new(
        category: Category,
        description: impl Into<String>,
        confidence: f64,
        expected_gain: f64,
        risk_level: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            description: description.into(),
            confidence: unit_interval(confidence),
            expected_gain: if expected_gain.is_finite() { expected_gain } else { 0.0 },
            risk_level: unit_interval(risk_level),
            origin: Origin::Routine,
            status: Status::Pending,
            test_results: None,
            created_at_ms: now_ms(),
            deployed_at_ms: None,
            outcome_reason: None,
            failed_phase: None,
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_created_at_ms(mut self, ts: u64) -> Self {
        self.created_at_ms = ts;
        self
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn category(&self) -> &Category { &self.category }
    pub fn description(&self) -> &str { &self.description }
    pub fn confidence(&self) -> f64 { self.confidence }
    pub fn expected_gain(&self) -> f64 { self.expected_gain }
    pub fn risk_level(&self) -> f64 { self.risk_level }
    pub fn origin(&self) -> Origin { self.origin }
    pub fn status(&self) -> &Status { &self.status }
    pub fn test_results(&self) -> Option<&TestResults> { self.test_results.as_ref() }
    pub fn created_at_ms(&self) -> u64 { self.created_at_ms }
    pub fn deployed_at_ms(&self) -> Option<u64> { self.deployed_at_ms }
    pub fn outcome_reason(&self) -> Option<&str> { self.outcome_reason.as_deref() }
    pub fn failed_phase(&self) -> Option<&str> { self.failed_phase.as_deref() }

    /// Queue priority implied by the origin.
    pub fn priority(&self) -> f64 {
        self.origin.priority(self.expected_gain)
    }

    /// Discovery ranking: `gain × confidence / (1 + risk)`.
    pub fn ranking_score(&self) -> f64 {
        self.expected_gain * self.confidence / (1.0 + self.risk_level)
    }

    /// Move to `next`, enforcing the lifecycle state machine.
    pub(crate) fn transition(&mut self, next: Status) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(LoopError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(
            target: "improvement",
            id = %self.id,
            from = %self.status,
            to = %next,
            "status transition"
        );
        self.status = next;
        Ok(())
    }

    /// Attach harness results. Results are immutable once set.
    pub(crate) fn attach_results(&mut self, results: TestResults) -> Result<()> {
        if self.test_results.is_some() {
            return Err(LoopError::ResultsAlreadyAttached(self.id.clone()));
        }
        self.test_results = Some(results);
        Ok(())
    }

    /// Move to a terminal or settled state and record why.
    pub(crate) fn settle(&mut self, next: Status, reason: impl Into<String>) -> Result<()> {
        let phase = match &self.status {
            Status::Phase { name, .. } => Some(name.clone()),
            _ => None,
        };
        let deployed = matches!(next, Status::Deployed);
        self.transition(next)?;
        if deployed {
            self.deployed_at_ms = Some(now_ms());
        } else if phase.is_some() {
            self.failed_phase = phase;
        }
        self.outcome_reason = Some(reason.into());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
