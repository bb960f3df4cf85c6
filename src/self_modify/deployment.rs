//! # Stage: Phased Deployment & Rollback
//!
//! ## Responsibility
//! Takes an improvement that passed the deployment decision and walks it
//! through the rollout plan against a single [`DeploymentTarget`]:
//!
//! ```text
//! capture rollback point
//! for each phase:
//!     apply at phase.exposure          ── error ──► rollback
//!     observe for phase.min_duration
//!     evaluate phase.gate vs baseline  ── fail  ──► rollback
//!     wait phase.stabilization
//! mark Deployed
//! ```
//!
//! ## Guarantees
//! - Ordered: phases run strictly in plan order; a rollback stops the walk.
//! - Verified rollback: an improvement is only marked `RolledBack` after the
//!   target confirms restoration. An unverified restore marks it `Failed` and
//!   reports [`DeploymentError::RollbackUnverified`] (critical).
//! - Idempotent: rolling back an already rolled-back improvement succeeds
//!   without touching the target.
//! - Retained points: a rollback point is released only after its restore is
//!   verified, so an escalated rollback can be retried.
//! - Non-panicking: all error surfaces are `Result`-typed.
//!
//! ## NOT Responsible For
//! - The deployment decision (see [`gate`](super::gate))
//! - Refreshing the baseline or recording history (the pipeline does both
//!   from the returned [`DeploymentResult`])

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::secs;
use crate::error::{Result, Severity};
use crate::improvement::{Improvement, Status};
use crate::metrics::PerformanceMetrics;
use crate::now_ms;
use crate::self_modify::gate::QualityGate;
use crate::sources::MetricsSource;

// ---------------------------------------------------------------------------
// DeploymentPhase
// ---------------------------------------------------------------------------

/// One step of the rollout plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentPhase {
    pub name: String,
    /// Share of traffic exposed to the candidate, in `(0, 1]`.
    pub exposure: f64,
    /// Observation window before the gate is evaluated.
    pub min_duration_secs: f64,
    /// Extra wait after the gate passes, before the next phase.
    pub stabilization_secs: f64,
    pub gate: QualityGate,
}

impl Default for DeploymentPhase {
    fn default() -> Self {
        Self::new("phase", 1.0, 0.0, 0.0, QualityGate::default())
    }
}

impl DeploymentPhase {
    pub fn new(
        name: impl Into<String>,
        exposure: f64,
        min_duration_secs: f64,
        stabilization_secs: f64,
        gate: QualityGate,
    ) -> Self {
        Self { name: name.into(), exposure, min_duration_secs, stabilization_secs, gate }
    }

    pub fn min_duration(&self) -> Duration { secs(self.min_duration_secs) }
    pub fn stabilization(&self) -> Duration { secs(self.stabilization_secs) }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if !(self.exposure > 0.0 && self.exposure <= 1.0) {
            return Err(format!("exposure must be in (0, 1], got {}", self.exposure));
        }
        for (field, v) in [
            ("min_duration_secs", self.min_duration_secs),
            ("stabilization_secs", self.stabilization_secs),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("{field} must be finite and non-negative, got {v}"));
            }
        }
        self.gate.validate()
    }
}

// ---------------------------------------------------------------------------
// RollbackPoint
// ---------------------------------------------------------------------------

/// Pre-deployment state captured from the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: String,
    pub improvement_id: String,
    pub target: String,
    pub captured_at_ms: u64,
    /// Opaque, target-defined snapshot.
    pub state: serde_json::Value,
}

// ---------------------------------------------------------------------------
// DeploymentTarget trait
// ---------------------------------------------------------------------------

/// The live system an improvement is rolled out to.
///
/// Object-safe so targets can be held as `Arc<dyn DeploymentTarget>`.
/// Implementations must never panic; failures are returned as
/// [`DeploymentError`].
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    /// A stable human-readable name used in error messages and audit logs.
    fn name(&self) -> &str;

    /// Snapshot the state needed to undo `improvement`, and only that.
    /// Several rollouts may be in flight against one target.
    async fn capture(&self, improvement: &Improvement) -> std::result::Result<serde_json::Value, DeploymentError>;

    /// Serve `improvement` to `exposure` of traffic.
    async fn apply(&self, improvement: &Improvement, exposure: f64) -> std::result::Result<(), DeploymentError>;

    /// Undo the improvement `point` was captured for, leaving any other
    /// live improvement untouched.
    async fn restore(&self, point: &RollbackPoint) -> std::result::Result<(), DeploymentError>;

    /// `true` when the live state matches `point`.
    async fn verify_restored(&self, point: &RollbackPoint) -> std::result::Result<bool, DeploymentError>;
}

// ---------------------------------------------------------------------------
// DeploymentError
// ---------------------------------------------------------------------------

/// All errors that can arise while rolling out or rolling back.
#[derive(Debug)]
pub enum DeploymentError {
    /// The target rejected an apply at some exposure.
    TargetFailed { target: String, reason: String },
    /// No rollback point could be captured; nothing was applied.
    CaptureFailed { target: String, reason: String },
    /// Restore could not begin. Live state is unknown.
    RestoreFailed { improvement_id: String, reason: String },
    /// Restore ran but the target could not confirm it.
    RollbackUnverified { improvement_id: String, reason: String },
    /// There is no retained rollback point for the improvement.
    NoRollbackPoint { improvement_id: String },
    /// The improvement is not in a status this operation accepts.
    InvalidState { improvement_id: String, status: String },
    /// Live metrics could not be read during a phase observation window.
    ObservationFailed { phase: String, reason: String },
    /// The rollout plan has no phases.
    EmptyPlan,
}

impl DeploymentError {
    /// Errors that leave live state unknown and need an operator.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            DeploymentError::RestoreFailed { .. }
                | DeploymentError::RollbackUnverified { .. }
                | DeploymentError::NoRollbackPoint { .. }
        )
    }

    pub fn severity(&self) -> Severity {
        if self.is_critical() { Severity::Critical } else { Severity::Error }
    }
}

impl std::fmt::Display for DeploymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentError::TargetFailed { target, reason } => {
                write!(f, "target '{}' failed: {}", target, reason)
            }
            DeploymentError::CaptureFailed { target, reason } => {
                write!(f, "could not capture rollback point on '{}': {}", target, reason)
            }
            DeploymentError::RestoreFailed { improvement_id, reason } => {
                write!(f, "rollback of '{}' could not begin: {}", improvement_id, reason)
            }
            DeploymentError::RollbackUnverified { improvement_id, reason } => {
                write!(f, "rollback of '{}' is unverified: {}", improvement_id, reason)
            }
            DeploymentError::NoRollbackPoint { improvement_id } => {
                write!(f, "no rollback point retained for '{}'", improvement_id)
            }
            DeploymentError::InvalidState { improvement_id, status } => {
                write!(f, "improvement '{}' cannot be deployed from status {}", improvement_id, status)
            }
            DeploymentError::ObservationFailed { phase, reason } => {
                write!(f, "could not observe phase '{}': {}", phase, reason)
            }
            DeploymentError::EmptyPlan => write!(f, "deployment plan has no phases"),
        }
    }
}

impl std::error::Error for DeploymentError {}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one rollback attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackResult {
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    /// Set when the failure needs an operator.
    pub severity: Option<Severity>,
}

impl RollbackResult {
    fn ok(duration: Duration) -> Self {
        Self { success: true, error: None, duration, severity: None }
    }

    fn failed(err: &DeploymentError, duration: Duration) -> Self {
        Self { success: false, error: Some(err.to_string()), duration, severity: Some(err.severity()) }
    }
}

/// Outcome of one rollout.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentResult {
    pub success: bool,
    /// Last phase entered; on failure, the phase that stopped the rollout.
    pub phase: Option<String>,
    pub reason: Option<String>,
    pub duration: Duration,
    /// Snapshot observed in the last phase. Becomes the new baseline on success.
    pub observed: Option<PerformanceMetrics>,
    /// The automatic rollback, when one ran.
    pub rollback: Option<RollbackResult>,
}

impl DeploymentResult {
    /// Highest severity this rollout produced, `None` for a clean outcome.
    pub fn severity(&self) -> Option<Severity> {
        self.rollback.as_ref().and_then(|r| r.severity)
    }
}

// ---------------------------------------------------------------------------
// Deployer
// ---------------------------------------------------------------------------

/// Drives the phased rollout and rollback state machine.
///
/// Rollback points of deployed improvements are retained so a later manual
/// rollback can restore them.
pub struct Deployer {
    target: Arc<dyn DeploymentTarget>,
    metrics: Arc<dyn MetricsSource>,
    plan: Vec<DeploymentPhase>,
    points: Mutex<HashMap<String, RollbackPoint>>,
}

impl Deployer {
    pub fn new(target: Arc<dyn DeploymentTarget>, metrics: Arc<dyn MetricsSource>, plan: Vec<DeploymentPhase>) -> Self {
        Self { target, metrics, plan, points: Mutex::new(HashMap::new()) }
    }

    pub fn plan(&self) -> &[DeploymentPhase] {
        &self.plan
    }

    pub fn target_name(&self) -> &str {
        self.target.name()
    }

    /// Retained rollback point for `improvement_id`, if any.
    pub fn rollback_point(&self, improvement_id: &str) -> Option<RollbackPoint> {
        self.points().get(improvement_id).cloned()
    }

    fn points(&self) -> MutexGuard<'_, HashMap<String, RollbackPoint>> {
        self.points.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Roll `improvement` out through every phase of the plan.
    ///
    /// `improvement` must be in `Testing`. Negative outcomes (capture failure,
    /// apply error, gate failure) are reported in the returned
    /// [`DeploymentResult`] with the improvement already settled.
    ///
    /// # Errors
    /// [`DeploymentError::InvalidState`] or [`DeploymentError::EmptyPlan`]
    /// before anything is touched, or a state-machine violation.
    pub async fn deploy(&self, improvement: &mut Improvement, baseline: &PerformanceMetrics) -> Result<DeploymentResult> {
        if !matches!(improvement.status(), Status::Testing) {
            return Err(DeploymentError::InvalidState {
                improvement_id: improvement.id().to_string(),
                status: improvement.status().to_string(),
            }
            .into());
        }
        if self.plan.is_empty() {
            return Err(DeploymentError::EmptyPlan.into());
        }

        let started = Instant::now();
        let id = improvement.id().to_string();

        let state = match self.target.capture(improvement).await {
            Ok(state) => state,
            Err(e) => {
                let reason = format!("rollback never began: {e}");
                tracing::warn!(target: "self_modify::deployment", id = %id, error = %e, "rollback point capture failed");
                improvement.settle(Status::Failed, reason.clone())?;
                return Ok(DeploymentResult {
                    success: false,
                    phase: None,
                    reason: Some(reason),
                    duration: started.elapsed(),
                    observed: None,
                    rollback: None,
                });
            }
        };
        self.points().insert(
            id.clone(),
            RollbackPoint {
                id: uuid::Uuid::new_v4().to_string(),
                improvement_id: id.clone(),
                target: self.target.name().to_string(),
                captured_at_ms: now_ms(),
                state,
            },
        );

        let mut observed = None;
        for (index, phase) in self.plan.iter().enumerate() {
            improvement.transition(Status::Phase { index, name: phase.name.clone() })?;
            tracing::info!(
                target: "self_modify::deployment",
                id = %id,
                phase = %phase.name,
                exposure = phase.exposure,
                "entering rollout phase"
            );

            if let Err(e) = self.target.apply(improvement, phase.exposure).await {
                let reason = format!("apply failed in phase '{}': {e}", phase.name);
                return Ok(self.abort(improvement, phase, reason, started).await);
            }

            tokio::time::sleep(phase.min_duration()).await;
            let snapshot = match self.metrics.current().await {
                Ok(m) => m.sanitized(),
                Err(e) => {
                    let err = DeploymentError::ObservationFailed { phase: phase.name.clone(), reason: e.to_string() };
                    return Ok(self.abort(improvement, phase, err.to_string(), started).await);
                }
            };

            let gate = phase.gate.evaluate(&snapshot, baseline);
            if !gate.passed {
                let detail = gate.failure_reason().unwrap_or_default();
                let reason = format!("quality gate failed in phase '{}': {detail}", phase.name);
                return Ok(self.abort(improvement, phase, reason, started).await);
            }

            observed = Some(snapshot);
            tokio::time::sleep(phase.stabilization()).await;
        }

        let last = self.plan.last().map(|p| p.name.clone());
        improvement.settle(Status::Deployed, format!("passed all {} rollout phases", self.plan.len()))?;
        tracing::info!(
            target: "self_modify::deployment",
            id = %id,
            phases = self.plan.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "improvement deployed"
        );

        Ok(DeploymentResult {
            success: true,
            phase: last,
            reason: None,
            duration: started.elapsed(),
            observed,
            rollback: None,
        })
    }

    async fn abort(
        &self,
        improvement: &mut Improvement,
        phase: &DeploymentPhase,
        reason: String,
        started: Instant,
    ) -> DeploymentResult {
        tracing::warn!(
            target: "self_modify::deployment",
            id = %improvement.id(),
            phase = %phase.name,
            reason = %reason,
            "rollout stopped, rolling back"
        );
        let rollback = self.revert(improvement, &reason).await;
        DeploymentResult {
            success: false,
            phase: Some(phase.name.clone()),
            reason: Some(reason),
            duration: started.elapsed(),
            observed: None,
            rollback: Some(rollback),
        }
    }

    /// Roll back `improvement` to its retained rollback point.
    ///
    /// Accepts improvements mid-rollout or `Deployed`. An improvement that is
    /// already `RolledBack` is a successful no-op. A `Failed` improvement whose
    /// earlier rollback escalated still holds its rollback point; calling this
    /// again retries the restore without changing its status.
    pub async fn rollback(&self, improvement: &mut Improvement, reason: &str) -> RollbackResult {
        match improvement.status() {
            Status::RolledBack => RollbackResult::ok(Duration::ZERO),
            Status::Phase { .. } | Status::Deployed => self.revert(improvement, reason).await,
            Status::Failed if self.points().contains_key(improvement.id()) => {
                let started = Instant::now();
                match self.restore_point(improvement.id()).await {
                    Ok(()) => {
                        tracing::info!(target: "self_modify::deployment", id = %improvement.id(), "escalated rollback retried and verified");
                        RollbackResult::ok(started.elapsed())
                    }
                    Err(e) => {
                        tracing::error!(target: "self_modify::deployment", id = %improvement.id(), error = %e, "rollback retry escalated");
                        RollbackResult::failed(&e, started.elapsed())
                    }
                }
            }
            other => {
                let err = DeploymentError::InvalidState {
                    improvement_id: improvement.id().to_string(),
                    status: other.to_string(),
                };
                RollbackResult { success: false, error: Some(err.to_string()), duration: Duration::ZERO, severity: None }
            }
        }
    }

    /// Restore and verify the point held for `id`. The point is released only
    /// once restoration is verified.
    async fn restore_point(&self, id: &str) -> std::result::Result<(), DeploymentError> {
        let point = self
            .points()
            .get(id)
            .cloned()
            .ok_or_else(|| DeploymentError::NoRollbackPoint { improvement_id: id.to_string() })?;

        if let Err(e) = self.target.restore(&point).await {
            return Err(DeploymentError::RestoreFailed { improvement_id: id.to_string(), reason: e.to_string() });
        }
        match self.target.verify_restored(&point).await {
            Ok(true) => {
                self.points().remove(id);
                Ok(())
            }
            Ok(false) => Err(DeploymentError::RollbackUnverified {
                improvement_id: id.to_string(),
                reason: "restored state does not match rollback point".to_string(),
            }),
            Err(e) => Err(DeploymentError::RollbackUnverified { improvement_id: id.to_string(), reason: e.to_string() }),
        }
    }

    async fn revert(&self, improvement: &mut Improvement, reason: &str) -> RollbackResult {
        let started = Instant::now();
        let id = improvement.id().to_string();
        let outcome = self.restore_point(&id).await;

        let settled = match &outcome {
            Ok(()) => improvement.settle(Status::RolledBack, reason),
            Err(e) => improvement.settle(Status::Failed, format!("{reason}; {e}")),
        };
        if let Err(e) = settled {
            tracing::error!(target: "self_modify::deployment", id = %id, error = %e, "could not settle after rollback");
        }

        match outcome {
            Ok(()) => {
                tracing::info!(target: "self_modify::deployment", id = %id, reason, "rolled back and verified");
                RollbackResult::ok(started.elapsed())
            }
            Err(e) => {
                tracing::error!(target: "self_modify::deployment", id = %id, error = %e, "rollback escalated");
                RollbackResult::failed(&e, started.elapsed())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryTarget
// ---------------------------------------------------------------------------

/// Failure modes an [`InMemoryTarget`] can be told to exhibit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetFaults {
    pub fail_capture: bool,
    /// Reject any apply at an exposure strictly above this.
    pub fail_apply_above: Option<f64>,
    /// Reject applies of one improvement id above an exposure.
    pub fail_apply_for: Option<(String, f64)>,
    pub fail_restore: bool,
    /// Report restoration as unconfirmed.
    pub unverifiable: bool,
}

/// What one improvement had live before its rollout began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ScopedState {
    improvement_id: String,
    /// `None` when the improvement was not live at all.
    exposure: Option<f64>,
}

/// A `DeploymentTarget` that keeps its live state in memory.
///
/// Rollback points are scoped to a single improvement: restoring one only
/// touches that improvement's entry, so concurrent rollouts survive a
/// sibling's rollback. Used by tests and the simulated pipeline.
pub struct InMemoryTarget {
    name: String,
    /// `(improvement_id, exposure)` in first-apply order.
    live: Mutex<Vec<(String, f64)>>,
    faults: Mutex<TargetFaults>,
    applies: Mutex<Vec<(String, f64)>>,
}

impl InMemoryTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            live: Mutex::new(Vec::new()),
            faults: Mutex::new(TargetFaults::default()),
            applies: Mutex::new(Vec::new()),
        }
    }

    pub fn set_faults(&self, faults: TargetFaults) {
        *self.faults.lock().unwrap_or_else(PoisonError::into_inner) = faults;
    }

    fn faults(&self) -> TargetFaults {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn live(&self) -> MutexGuard<'_, Vec<(String, f64)>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exposure_of(&self, improvement_id: &str) -> Option<f64> {
        self.live().iter().find(|(id, _)| id == improvement_id).map(|(_, e)| *e)
    }

    /// Ids of improvements currently live.
    pub fn active(&self) -> Vec<String> {
        self.live().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Exposure currently served for `improvement_id`, if live.
    pub fn exposure(&self, improvement_id: &str) -> Option<f64> {
        self.exposure_of(improvement_id)
    }

    /// Every `(improvement_id, exposure)` apply received, in order.
    pub fn applies(&self) -> Vec<(String, f64)> {
        self.applies.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn failed(&self, reason: &str) -> DeploymentError {
        DeploymentError::TargetFailed { target: self.name.clone(), reason: reason.to_string() }
    }
}

#[async_trait]
impl DeploymentTarget for InMemoryTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn capture(&self, improvement: &Improvement) -> std::result::Result<serde_json::Value, DeploymentError> {
        if self.faults().fail_capture {
            return Err(DeploymentError::CaptureFailed { target: self.name.clone(), reason: "snapshot refused".into() });
        }
        let scoped = ScopedState {
            improvement_id: improvement.id().to_string(),
            exposure: self.exposure_of(improvement.id()),
        };
        serde_json::to_value(&scoped)
            .map_err(|e| DeploymentError::CaptureFailed { target: self.name.clone(), reason: e.to_string() })
    }

    async fn apply(&self, improvement: &Improvement, exposure: f64) -> std::result::Result<(), DeploymentError> {
        let faults = self.faults();
        if let Some(limit) = faults.fail_apply_above {
            if exposure > limit {
                return Err(self.failed(&format!("exposure {exposure} rejected")));
            }
        }
        if let Some((id, limit)) = &faults.fail_apply_for {
            if id == improvement.id() && exposure > *limit {
                return Err(self.failed(&format!("exposure {exposure} rejected for {id}")));
            }
        }
        self.applies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((improvement.id().to_string(), exposure));
        let mut live = self.live();
        match live.iter_mut().find(|(id, _)| id == improvement.id()) {
            Some(entry) => entry.1 = exposure,
            None => live.push((improvement.id().to_string(), exposure)),
        }
        Ok(())
    }

    async fn restore(&self, point: &RollbackPoint) -> std::result::Result<(), DeploymentError> {
        if self.faults().fail_restore {
            return Err(self.failed("restore refused"));
        }
        let scoped: ScopedState = serde_json::from_value(point.state.clone())
            .map_err(|e| self.failed(&format!("unreadable rollback point: {e}")))?;
        if scoped.improvement_id != point.improvement_id {
            return Err(self.failed("rollback point belongs to another improvement"));
        }
        let mut live = self.live();
        match scoped.exposure {
            None => live.retain(|(id, _)| *id != scoped.improvement_id),
            Some(previous) => match live.iter_mut().find(|(id, _)| *id == scoped.improvement_id) {
                Some(entry) => entry.1 = previous,
                None => live.push((scoped.improvement_id, previous)),
            },
        }
        Ok(())
    }

    async fn verify_restored(&self, point: &RollbackPoint) -> std::result::Result<bool, DeploymentError> {
        if self.faults().unverifiable {
            return Ok(false);
        }
        let scoped: ScopedState = serde_json::from_value(point.state.clone()).map_err(|e| self.failed(&e.to_string()))?;
        Ok(self.exposure_of(&scoped.improvement_id) == scoped.exposure)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
