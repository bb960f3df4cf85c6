//! # Stage: Isolated Evaluation
//!
//! ## Responsibility
//! Contract for the test harness that evaluates a candidate in isolation, and
//! the [`Evaluator`] that drives one full harness session:
//! provision → apply → run → teardown.
//!
//! ## Guarantees
//! - Bounded: `apply` + `run` together are held to the suite timeout.
//! - Clean: `teardown` runs whenever `provision` succeeded, including after a
//!   failed or timed-out run. A teardown failure is logged, never surfaced.
//! - Pluggable scoring: `overall_improvement` comes from an
//!   [`ImprovementScorer`], [`MeanRelativeGain`] by default.
//!
//! ## NOT Responsible For
//! - Deciding whether to deploy (see [`gate`](super::gate))
//! - Mutating the improvement's status (the lifecycle does that)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::improvement::{
    Improvement, PerformanceResults, ResourceResults, StabilityResults, TestResults,
};
use crate::metrics::{BaselineComparison, PerformanceMetrics};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by a [`TestHarness`] or by the [`Evaluator`] itself.
#[derive(Debug)]
pub enum HarnessError {
    /// No isolated environment could be created.
    Provision { reason: String },
    /// The candidate could not be installed into the environment.
    Apply { improvement_id: String, reason: String },
    /// The suite ran but did not produce results.
    Run { suite: String, reason: String },
    /// `apply` + `run` exceeded the suite timeout.
    Timeout { suite: String, after: Duration },
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Provision { reason } => {
                write!(f, "could not provision test environment: {}", reason)
            }
            HarnessError::Apply { improvement_id, reason } => {
                write!(f, "could not apply improvement '{}': {}", improvement_id, reason)
            }
            HarnessError::Run { suite, reason } => {
                write!(f, "suite '{}' failed to run: {}", suite, reason)
            }
            HarnessError::Timeout { suite, after } => {
                write!(f, "suite '{}' timed out after {:?}", suite, after)
            }
        }
    }
}

impl std::error::Error for HarnessError {}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Handle to one isolated environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEnvironment {
    pub id: String,
}

/// The regression/evaluation suite to run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSuite {
    pub name: String,
    pub timeout: Duration,
}

impl Default for TestSuite {
    fn default() -> Self {
        Self { name: "regression".to_string(), timeout: Duration::from_secs(1800) }
    }
}

/// Raw measurements from one suite run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuiteRun {
    pub metrics: PerformanceMetrics,
    /// Fraction of the suite that behaved reliably, in `[0, 1]`.
    pub reliability: f64,
    /// Baseline resource cost divided by candidate cost.
    pub efficiency: f64,
}

/// Runs candidates in isolated environments.
#[async_trait]
pub trait TestHarness: Send + Sync {
    async fn provision(&self) -> Result<TestEnvironment, HarnessError>;

    async fn apply(&self, env: &TestEnvironment, improvement: &Improvement) -> Result<(), HarnessError>;

    async fn run(&self, env: &TestEnvironment, suite: &TestSuite) -> Result<SuiteRun, HarnessError>;

    async fn teardown(&self, _env: &TestEnvironment) -> Result<(), HarnessError> {
        Ok(())
    }
}

/// Collapses a suite run into a single `overall_improvement` figure.
pub trait ImprovementScorer: Send + Sync {
    fn score(&self, comparison: &BaselineComparison, run: &SuiteRun) -> f64;
}

/// Mean of the four oriented relative deltas against the baseline.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanRelativeGain;

impl ImprovementScorer for MeanRelativeGain {
    fn score(&self, comparison: &BaselineComparison, _run: &SuiteRun) -> f64 {
        comparison.mean()
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Drives one harness session per candidate and assembles [`TestResults`].
#[derive(Clone)]
pub struct Evaluator {
    harness: Arc<dyn TestHarness>,
    scorer: Arc<dyn ImprovementScorer>,
    suite: TestSuite,
}

impl Evaluator {
    pub fn new(harness: Arc<dyn TestHarness>, suite: TestSuite) -> Self {
        Self { harness, scorer: Arc::new(MeanRelativeGain), suite }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ImprovementScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn suite(&self) -> &TestSuite {
        &self.suite
    }

    /// Evaluate `improvement` against `baseline`.
    ///
    /// # Errors
    /// Any harness failure, or [`HarnessError::Timeout`] when `apply` + `run`
    /// outlast the suite timeout.
    pub async fn evaluate(
        &self,
        improvement: &Improvement,
        baseline: &PerformanceMetrics,
    ) -> Result<TestResults, HarnessError> {
        let started = Instant::now();
        let env = self.harness.provision().await?;

        let session = async {
            self.harness.apply(&env, improvement).await?;
            self.harness.run(&env, &self.suite).await
        };
        let outcome = match tokio::time::timeout(self.suite.timeout, session).await {
            Ok(res) => res,
            Err(_) => Err(HarnessError::Timeout { suite: self.suite.name.clone(), after: self.suite.timeout }),
        };

        if let Err(e) = self.harness.teardown(&env).await {
            tracing::warn!(target: "self_modify::harness", env = %env.id, error = %e, "teardown failed");
        }

        let run = outcome?;
        let metrics = run.metrics.sanitized();
        let comparison = BaselineComparison::between(&metrics, baseline);
        let overall_improvement = self.scorer.score(&comparison, &run);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        tracing::debug!(
            target: "self_modify::harness",
            id = %improvement.id(),
            overall_improvement,
            reliability = run.reliability,
            efficiency = run.efficiency,
            duration_ms,
            "evaluation complete"
        );

        Ok(TestResults {
            performance: PerformanceResults { metrics, overall_improvement },
            stability: StabilityResults { reliability: run.reliability },
            resources: ResourceResults { efficiency: run.efficiency },
            comparison,
            duration_ms,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
