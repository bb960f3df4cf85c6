//! # Module: pipeline
//!
//! ## Responsibility
//! The operational surface of the improvement loop. Owns the collaborators,
//! the pinned baseline, the history store and the event bus, and runs the
//! per-improvement lifecycle:
//!
//! ```text
//! Pending ─► Testing ─► harness ─► decision ─┬─► rollout ─► Deployed
//!                │                           │      └─────► RolledBack / Failed
//!                └─► Failed (test error)      └─► Failed (rejected)
//! ```
//!
//! Every outcome is recorded in history with its reason and announced on the
//! event bus.
//!
//! ## Guarantees
//! - The baseline only changes after a successful deployment or an explicit
//!   [`Pipeline::rebaseline`].
//! - Read-only queries ([`Pipeline::history`], [`Pipeline::report`],
//!   [`Pipeline::baseline`], [`Pipeline::status_snapshot`]) never mutate
//!   loop state.
//! - `Send + Sync`: one `Arc<Pipeline>` is shared by the loop task and every
//!   worker task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::LoopConfig;
use crate::error::{LoopError, Result, Severity};
use crate::events::{EventBus, LoopEvent};
use crate::improvement::{Improvement, Origin, Status, StatusKind, TestResults};
use crate::metrics::PerformanceMetrics;
use crate::now_ms;
use crate::self_modify::deployment::{DeploymentResult, DeploymentTarget, Deployer, RollbackResult};
use crate::self_modify::harness::{Evaluator, ImprovementScorer, TestHarness, TestSuite};
use crate::self_modify::memory::{HistoryFilter, ImprovementHistory, ImprovementReport};
use crate::self_tune::degradation::{DegradationDetector, DegradationReport};
use crate::self_tune::orchestrator::{ImprovementLoop, LoopHandle};
use crate::sources::{CandidateProducer, FeedbackSource, MetricsSource};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// External systems the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub metrics: Arc<dyn MetricsSource>,
    pub producer: Arc<dyn CandidateProducer>,
    pub harness: Arc<dyn TestHarness>,
    pub target: Arc<dyn DeploymentTarget>,
    pub feedback: Arc<dyn FeedbackSource>,
}

// ---------------------------------------------------------------------------
// LoopStatus
// ---------------------------------------------------------------------------

/// Counters and flags readable from outside the loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopStatus {
    pub running: bool,
    pub iterations: u64,
    pub iteration_errors: u64,
    pub degradations: u64,
    pub deployed: u64,
    pub rejected: u64,
    pub rolled_back: u64,
    pub failed: u64,
    /// Queue length at the end of the last iteration.
    pub queue_len: usize,
    /// Sleep chosen after the last iteration.
    pub last_interval_secs: f64,
    pub last_error: Option<String>,
}

/// How a lifecycle ended, for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Deployed,
    Rejected,
    RolledBack,
    Failed,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Continuous-improvement pipeline.
pub struct Pipeline {
    config: LoopConfig,
    metrics: Arc<dyn MetricsSource>,
    producer: Arc<dyn CandidateProducer>,
    feedback: Arc<dyn FeedbackSource>,
    evaluator: Evaluator,
    deployer: Deployer,
    detector: DegradationDetector,
    events: EventBus,
    baseline: RwLock<Option<PerformanceMetrics>>,
    history: Mutex<ImprovementHistory>,
    status: Mutex<LoopStatus>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("phases", &self.deployer.plan().len())
            .field("target", &self.deployer.target_name())
            .field("status", &self.status_snapshot())
            .finish()
    }
}

impl Pipeline {
    pub fn new(config: LoopConfig, collaborators: Collaborators) -> Self {
        let suite = TestSuite { name: config.harness.suite.clone(), timeout: config.harness.timeout() };
        let evaluator = Evaluator::new(collaborators.harness, suite);
        let deployer = Deployer::new(
            collaborators.target,
            Arc::clone(&collaborators.metrics),
            config.deployment.phases.clone(),
        );
        Self {
            detector: DegradationDetector::new(config.detector.tolerance),
            events: EventBus::new(config.timing.event_capacity),
            metrics: collaborators.metrics,
            producer: collaborators.producer,
            feedback: collaborators.feedback,
            evaluator,
            deployer,
            baseline: RwLock::new(None),
            history: Mutex::new(ImprovementHistory::new()),
            status: Mutex::new(LoopStatus::default()),
            config,
        }
    }

    /// Replace the `overall_improvement` scoring strategy.
    pub fn with_scorer(mut self, scorer: Arc<dyn ImprovementScorer>) -> Self {
        self.evaluator = self.evaluator.with_scorer(scorer);
        self
    }

    /// Start from an existing (for example rehydrated) history.
    pub fn with_history(self, history: ImprovementHistory) -> Self {
        *self.history_mut() = history;
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: LoopEvent) {
        self.events.emit(event);
    }

    fn history_mut(&self) -> MutexGuard<'_, ImprovementHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status_mut(&self) -> MutexGuard<'_, LoopStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the continuous loop on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> LoopHandle {
        ImprovementLoop::new(Arc::clone(self)).spawn()
    }

    // -----------------------------------------------------------------------
    // Baseline
    // -----------------------------------------------------------------------

    /// The pinned baseline, fetched from the metrics source on first use.
    pub async fn baseline(&self) -> Result<PerformanceMetrics> {
        let pinned = *self.baseline.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(b) = pinned {
            return Ok(b);
        }
        let fetched = self.metrics.baseline().await?.sanitized();
        let mut slot = self.baseline.write().unwrap_or_else(PoisonError::into_inner);
        Ok(*slot.get_or_insert(fetched))
    }

    /// Re-pin the baseline from the metrics source.
    pub async fn rebaseline(&self) -> Result<PerformanceMetrics> {
        let fetched = self.metrics.baseline().await?.sanitized();
        self.set_baseline(fetched);
        tracing::info!(target: "pipeline", baseline = ?fetched, "baseline re-pinned");
        Ok(fetched)
    }

    fn set_baseline(&self, metrics: PerformanceMetrics) {
        *self.baseline.write().unwrap_or_else(PoisonError::into_inner) = Some(metrics);
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Compare live metrics with the baseline; announces a degradation.
    pub async fn check_degradation(&self) -> Result<DegradationReport> {
        let current = self.metrics.current().await?.sanitized();
        let baseline = self.baseline().await?;
        let report = self.detector.check(&current, &baseline);
        if report.degraded {
            self.status_mut().degradations += 1;
            self.emit(LoopEvent::DegradationDetected { current, baseline });
        }
        Ok(report)
    }

    /// One-shot routine discovery across every configured category.
    ///
    /// Categories are queried concurrently. Candidates are filtered by the
    /// discovery thresholds and ranked by `gain × confidence / (1 + risk)`,
    /// best first.
    pub async fn discover(&self) -> Result<Vec<Improvement>> {
        let d = &self.config.discovery;
        let batches = try_join_all(d.categories.iter().map(|c| self.producer.produce(c))).await?;

        let mut found: Vec<Improvement> = batches
            .into_iter()
            .flatten()
            .filter(|i| i.confidence() > d.min_confidence && i.expected_gain() > d.min_gain && i.risk_level() < d.max_risk)
            .map(|i| i.with_origin(Origin::Routine))
            .collect();
        found.sort_by(|a, b| b.ranking_score().total_cmp(&a.ranking_score()));

        tracing::info!(target: "pipeline", candidates = found.len(), "routine discovery complete");
        Ok(found)
    }

    /// Candidates targeting the regressions in `report`.
    pub async fn synthesize_urgent(&self, report: &DegradationReport) -> Result<Vec<Improvement>> {
        let urgent: Vec<Improvement> = self
            .producer
            .produce_for_degradation(report)
            .await?
            .into_iter()
            .map(|i| i.with_origin(Origin::Urgent))
            .collect();
        tracing::warn!(
            target: "pipeline",
            candidates = urgent.len(),
            dimensions = ?report.violated_dimensions(),
            "urgent candidates synthesized"
        );
        Ok(urgent)
    }

    /// Candidates derived from pending user feedback.
    pub async fn feedback_candidates(&self) -> Result<Vec<Improvement>> {
        let items = self.feedback.collect().await?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let produced = self.producer.produce_from_feedback(&items).await?;
        tracing::info!(target: "pipeline", feedback = items.len(), candidates = produced.len(), "feedback integrated");
        Ok(produced.into_iter().map(|i| i.with_origin(Origin::Feedback)).collect())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Run the test harness for one candidate without changing its status.
    pub async fn test(&self, improvement: &Improvement) -> Result<TestResults> {
        let baseline = self.baseline().await?;
        Ok(self.evaluator.evaluate(improvement, &baseline).await?)
    }

    /// Full lifecycle of one pending improvement: test, decide, roll out.
    ///
    /// Always returns the improvement in a settled state; every failure mode
    /// is recorded in history rather than returned.
    pub async fn evaluate_one(&self, mut improvement: Improvement) -> Improvement {
        if let Err(e) = improvement.transition(Status::Testing) {
            tracing::error!(target: "pipeline", error = %e, "improvement not pending, skipped");
            return improvement;
        }

        let tested = async {
            let baseline = self.baseline().await?;
            let results = self.evaluator.evaluate(&improvement, &baseline).await?;
            Ok::<_, LoopError>((baseline, results))
        }
        .await;

        let (baseline, results) = match tested {
            Ok(ok) => ok,
            Err(e) => {
                self.fail(&mut improvement, format!("test error: {e}"), e.severity());
                return improvement;
            }
        };
        if let Err(e) = improvement.attach_results(results.clone()) {
            self.fail(&mut improvement, e.to_string(), e.severity());
            return improvement;
        }

        let decision = self.config.decision.evaluate(&improvement, &results);
        if let Some(reason) = decision.rejection_reason() {
            tracing::warn!(target: "pipeline", id = %improvement.id(), reason = %reason, "improvement rejected");
            if let Err(e) = improvement.settle(Status::Failed, format!("rejected: {reason}")) {
                tracing::error!(target: "pipeline", error = %e, "could not settle rejected improvement");
            }
            self.emit(LoopEvent::ImprovementRejected { improvement: Box::new(improvement.clone()), reason });
            self.conclude(&improvement, Outcome::Rejected);
            return improvement;
        }
        tracing::info!(
            target: "pipeline",
            id = %improvement.id(),
            overall_improvement = results.performance.overall_improvement,
            "improvement accepted for rollout"
        );

        match self.deployer.deploy(&mut improvement, &baseline).await {
            Ok(result) => self.after_rollout(&improvement, &result),
            Err(e) => {
                let severity = e.severity();
                self.fail(&mut improvement, format!("rollout error: {e}"), severity);
            }
        }
        improvement
    }

    /// Operator-driven rollout, bypassing the deployment decision.
    ///
    /// Accepts a `Pending` or `Testing` improvement.
    pub async fn deploy(&self, improvement: &mut Improvement) -> Result<DeploymentResult> {
        let baseline = self.baseline().await?;
        if matches!(improvement.status(), Status::Pending) {
            improvement.transition(Status::Testing)?;
        }
        let result = self.deployer.deploy(improvement, &baseline).await?;
        self.after_rollout(improvement, &result);
        Ok(result)
    }

    /// Roll back a deployed or in-flight improvement. Idempotent.
    ///
    /// On a `Failed` improvement whose rollback escalated, retries the
    /// restore; its recorded outcome is left as is.
    pub async fn rollback(&self, improvement: &mut Improvement) -> RollbackResult {
        let already_terminal = improvement.status().is_terminal();
        let result = self.deployer.rollback(improvement, "manual rollback").await;
        if already_terminal {
            return result;
        }
        match improvement.status().kind() {
            StatusKind::RolledBack => {
                self.emit(LoopEvent::ImprovementRolledBack {
                    improvement: Box::new(improvement.clone()),
                    duration_ms: result.duration.as_millis() as u64,
                    reason: "manual rollback".to_string(),
                });
                self.conclude(improvement, Outcome::RolledBack);
            }
            StatusKind::Failed => {
                let reason = result.error.clone().unwrap_or_default();
                tracing::error!(target: "pipeline", id = %improvement.id(), reason = %reason, "operator attention required");
                self.emit(LoopEvent::ImprovementFailed {
                    improvement: Box::new(improvement.clone()),
                    reason,
                    severity: result.severity.unwrap_or(Severity::Error),
                });
                self.conclude(improvement, Outcome::Failed);
            }
            _ => {}
        }
        result
    }

    fn after_rollout(&self, improvement: &Improvement, result: &DeploymentResult) {
        let duration_ms = result.duration.as_millis() as u64;
        match improvement.status().kind() {
            StatusKind::Deployed => {
                if let Some(observed) = result.observed {
                    self.set_baseline(observed);
                }
                self.emit(LoopEvent::ImprovementDeployed { improvement: Box::new(improvement.clone()), duration_ms });
                self.conclude(improvement, Outcome::Deployed);
            }
            StatusKind::RolledBack => {
                self.emit(LoopEvent::ImprovementRolledBack {
                    improvement: Box::new(improvement.clone()),
                    duration_ms,
                    reason: result.reason.clone().unwrap_or_default(),
                });
                self.conclude(improvement, Outcome::RolledBack);
            }
            _ => {
                let severity = result.severity().unwrap_or(Severity::Error);
                let reason = improvement
                    .outcome_reason()
                    .map(str::to_string)
                    .or_else(|| result.reason.clone())
                    .unwrap_or_default();
                if severity == Severity::Critical {
                    tracing::error!(target: "pipeline", id = %improvement.id(), reason = %reason, "operator attention required");
                }
                self.emit(LoopEvent::ImprovementFailed { improvement: Box::new(improvement.clone()), reason, severity });
                self.conclude(improvement, Outcome::Failed);
            }
        }
    }

    fn fail(&self, improvement: &mut Improvement, reason: String, severity: Severity) {
        tracing::warn!(target: "pipeline", id = %improvement.id(), reason = %reason, "improvement failed");
        if !improvement.status().is_settled() {
            if let Err(e) = improvement.settle(Status::Failed, reason.clone()) {
                tracing::error!(target: "pipeline", error = %e, "could not settle failed improvement");
            }
        }
        self.emit(LoopEvent::ImprovementFailed { improvement: Box::new(improvement.clone()), reason, severity });
        self.conclude(improvement, Outcome::Failed);
    }

    /// Record an improvement whose lifecycle task panicked. The pool has
    /// already settled it `Failed`.
    pub(crate) fn record_aborted(&self, improvement: &Improvement) {
        let reason = improvement.outcome_reason().unwrap_or("evaluation task panicked").to_string();
        self.emit(LoopEvent::ImprovementFailed {
            improvement: Box::new(improvement.clone()),
            reason,
            severity: Severity::Error,
        });
        self.conclude(improvement, Outcome::Failed);
    }

    fn conclude(&self, improvement: &Improvement, outcome: Outcome) {
        self.history_mut().record(improvement.clone());
        let mut s = self.status_mut();
        match outcome {
            Outcome::Deployed => s.deployed += 1,
            Outcome::Rejected => s.rejected += 1,
            Outcome::RolledBack => s.rolled_back += 1,
            Outcome::Failed => s.failed += 1,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Recorded improvements matching `filter`, newest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<Improvement> {
        self.history_mut().query(filter)
    }

    pub fn report(&self) -> ImprovementReport {
        self.history_mut().report()
    }

    pub fn status_snapshot(&self) -> LoopStatus {
        self.status_mut().clone()
    }

    /// Queue length at the end of the last loop iteration.
    pub fn queue_len(&self) -> usize {
        self.status_mut().queue_len
    }

    /// Record a failed iteration.
    pub(crate) fn iteration_failed(&self, error: &LoopError) {
        {
            let mut s = self.status_mut();
            s.iteration_errors += 1;
            s.last_error = Some(error.to_string());
        }
        self.emit(LoopEvent::LoopError { error: error.to_string(), timestamp_ms: now_ms() });
    }

    /// Record a completed iteration (successful or not) and the chosen sleep.
    pub(crate) fn iteration_done(&self, queue_len: usize, interval: Duration) {
        let mut s = self.status_mut();
        s.iterations += 1;
        s.queue_len = queue_len;
        s.last_interval_secs = interval.as_secs_f64();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
