//! End-to-end tests of a single improvement's lifecycle through the
//! pipeline: harness, decision, phased rollout, rollback and history.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rstest::rstest;
use tokio::sync::broadcast;

use improvement_loop::self_modify::deployment::{DeploymentPhase, InMemoryTarget, TargetFaults};
use improvement_loop::self_modify::gate::QualityGate;
use improvement_loop::self_modify::harness::{HarnessError, SuiteRun, TestEnvironment, TestHarness, TestSuite};
use improvement_loop::sim::{QueuedFeedback, ScriptedProducer, SimulatedHarness, StaticMetrics};
use improvement_loop::{
    Category, Collaborators, HistoryFilter, Improvement, LoopConfig, LoopEvent, PerformanceMetrics, Pipeline,
    Severity, Status, StatusKind,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn baseline() -> PerformanceMetrics {
    PerformanceMetrics::new(0.90, 100.0, 50.0, 0.020)
}

fn improved() -> PerformanceMetrics {
    PerformanceMetrics::new(0.99, 90.0, 55.0, 0.018)
}

fn regressed() -> PerformanceMetrics {
    PerformanceMetrics::new(0.50, 100.0, 50.0, 0.020)
}

fn two_phase_config() -> LoopConfig {
    let mut config = LoopConfig::default();
    config.deployment.phases = vec![
        DeploymentPhase::new("canary", 0.1, 5.0, 2.0, QualityGate::with_tolerance(0.02)),
        DeploymentPhase::new("full", 1.0, 5.0, 2.0, QualityGate::with_tolerance(0.05)),
    ];
    config
}

struct Rig {
    pipeline: Pipeline,
    metrics: Arc<StaticMetrics>,
    target: Arc<InMemoryTarget>,
}

fn rig_with(config: LoopConfig, harness: Arc<dyn TestHarness>) -> Rig {
    let metrics = Arc::new(StaticMetrics::new(baseline(), improved()));
    let target = Arc::new(InMemoryTarget::new("primary"));
    let pipeline = Pipeline::new(
        config,
        Collaborators {
            metrics: metrics.clone(),
            producer: Arc::new(ScriptedProducer::default()),
            harness,
            target: target.clone(),
            feedback: Arc::new(QueuedFeedback::default()),
        },
    );
    Rig { pipeline, metrics, target }
}

fn rig() -> Rig {
    rig_with(two_phase_config(), Arc::new(SimulatedHarness::fixed(improved(), 0.99, 1.05)))
}

fn candidate(confidence: f64) -> Improvement {
    Improvement::new(Category::Architecture, "wider attention heads", confidence, 0.08, 0.1)
}

fn drain(rx: &mut broadcast::Receiver<LoopEvent>) -> Vec<LoopEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_two_phase_rollout_deploys_and_rebaselines() {
    let r = rig();
    let mut rx = r.pipeline.subscribe();

    let imp = r.pipeline.evaluate_one(candidate(0.9)).await;

    assert_eq!(imp.status(), &Status::Deployed);
    assert!(imp.deployed_at_ms().is_some());
    let results = imp.test_results().unwrap();
    assert!(results.performance.overall_improvement > 0.05);

    let exposures: Vec<f64> = r.target.applies().iter().map(|(_, e)| *e).collect();
    assert_eq!(exposures, vec![0.1, 1.0]);
    assert_eq!(r.pipeline.baseline().await.unwrap(), improved());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        LoopEvent::ImprovementDeployed { improvement, duration_ms } => {
            assert_eq!(improvement.id(), imp.id());
            // 5 + 2 + 5 + 2 seconds of observation and stabilization.
            assert!(*duration_ms >= 14_000);
        }
        other => panic!("unexpected {other:?}"),
    }

    let report = r.pipeline.report();
    assert_eq!(report.deployed_count, 1);
    assert_eq!(report.success_rate, 1.0);
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_low_confidence_never_enters_a_phase() {
    let r = rig();
    let mut rx = r.pipeline.subscribe();

    let imp = r.pipeline.evaluate_one(candidate(0.5)).await;

    assert_eq!(imp.status(), &Status::Failed);
    assert!(imp.outcome_reason().unwrap().starts_with("rejected:"));
    assert!(imp.failed_phase().is_none());
    assert!(r.target.applies().is_empty());
    assert!(r.target.active().is_empty());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name(), "improvement_rejected");
    assert_eq!(r.pipeline.history(&HistoryFilter::new().status(StatusKind::Failed)).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreliable_results_are_rejected() {
    let r = rig_with(two_phase_config(), Arc::new(SimulatedHarness::fixed(improved(), 0.80, 1.05)));
    let imp = r.pipeline.evaluate_one(candidate(0.9)).await;
    assert_eq!(imp.status(), &Status::Failed);
    assert!(imp.outcome_reason().unwrap().contains("reliability"));
}

// ---------------------------------------------------------------------------
// Automatic rollback
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_gate_failure_rolls_back_in_canary() {
    let r = rig();
    r.metrics.set_current(regressed());
    let mut rx = r.pipeline.subscribe();

    let imp = r.pipeline.evaluate_one(candidate(0.9)).await;

    assert_eq!(imp.status(), &Status::RolledBack);
    assert_eq!(imp.failed_phase(), Some("canary"));
    assert!(r.target.active().is_empty());
    assert_eq!(r.target.applies().len(), 1);
    assert_eq!(r.pipeline.baseline().await.unwrap(), baseline());

    match drain(&mut rx).as_slice() {
        [LoopEvent::ImprovementRolledBack { reason, .. }] => assert!(reason.contains("quality gate failed")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_apply_error_rolls_back_in_later_phase() {
    let r = rig();
    r.target.set_faults(TargetFaults { fail_apply_above: Some(0.5), ..TargetFaults::default() });

    let imp = r.pipeline.evaluate_one(candidate(0.9)).await;

    assert_eq!(imp.status(), &Status::RolledBack);
    assert_eq!(imp.failed_phase(), Some("full"));
    assert!(imp.outcome_reason().unwrap().contains("apply failed"));
    assert!(r.target.active().is_empty());
}

#[rstest]
#[case::restore_refused(TargetFaults { fail_restore: true, ..TargetFaults::default() }, "could not begin")]
#[case::unverifiable(TargetFaults { unverifiable: true, ..TargetFaults::default() }, "is unverified")]
#[tokio::test(start_paused = true)]
async fn test_broken_rollback_escalates_critical(#[case] faults: TargetFaults, #[case] expected: &str) {
    let r = rig();
    r.metrics.set_current(regressed());
    r.target.set_faults(faults);
    let mut rx = r.pipeline.subscribe();

    let imp = r.pipeline.evaluate_one(candidate(0.9)).await;

    assert_eq!(imp.status(), &Status::Failed);
    match drain(&mut rx).as_slice() {
        [LoopEvent::ImprovementFailed { severity, reason, .. }] => {
            assert_eq!(*severity, Severity::Critical);
            assert!(reason.contains(expected), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(r.pipeline.status_snapshot().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_capture_failure_fails_without_touching_target() {
    let r = rig();
    r.target.set_faults(TargetFaults { fail_capture: true, ..TargetFaults::default() });
    let mut rx = r.pipeline.subscribe();

    let imp = r.pipeline.evaluate_one(candidate(0.9)).await;

    assert_eq!(imp.status(), &Status::Failed);
    assert!(imp.outcome_reason().unwrap().contains("rollback never began"));
    assert!(r.target.applies().is_empty());
    match drain(&mut rx).as_slice() {
        [LoopEvent::ImprovementFailed { severity, .. }] => assert_eq!(*severity, Severity::Error),
        other => panic!("unexpected {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Manual operations
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_manual_rollback_restores_and_is_idempotent() {
    let r = rig();
    let mut imp = r.pipeline.evaluate_one(candidate(0.9)).await;
    assert_eq!(r.target.active(), vec![imp.id().to_string()]);
    let mut rx = r.pipeline.subscribe();

    let first = r.pipeline.rollback(&mut imp).await;
    assert!(first.success);
    assert_eq!(imp.status(), &Status::RolledBack);
    assert_eq!(imp.outcome_reason(), Some("manual rollback"));
    assert!(r.target.active().is_empty());

    let second = r.pipeline.rollback(&mut imp).await;
    assert!(second.success);
    assert_eq!(second.duration, Duration::ZERO);

    assert_eq!(drain(&mut rx).len(), 1);
    let history = r.pipeline.history(&HistoryFilter::new());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status(), &Status::RolledBack);
}

#[tokio::test(start_paused = true)]
async fn test_failed_manual_rollback_of_deployed_escalates_and_retries() {
    let r = rig();
    let mut imp = r.pipeline.evaluate_one(candidate(0.9)).await;
    assert_eq!(imp.status(), &Status::Deployed);
    r.target.set_faults(TargetFaults { fail_restore: true, ..TargetFaults::default() });
    let mut rx = r.pipeline.subscribe();

    let failed = r.pipeline.rollback(&mut imp).await;

    assert!(!failed.success);
    assert_eq!(failed.severity, Some(Severity::Critical));
    assert_eq!(imp.status(), &Status::Failed);
    match drain(&mut rx).as_slice() {
        [LoopEvent::ImprovementFailed { severity, reason, .. }] => {
            assert_eq!(*severity, Severity::Critical);
            assert!(reason.contains("could not begin"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    let history = r.pipeline.history(&HistoryFilter::new());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status(), &Status::Failed);
    assert_eq!(r.pipeline.status_snapshot().failed, 1);
    assert_eq!(r.target.active(), vec![imp.id().to_string()]);

    // The rollback point survived the escalation, so a retry can finish the job.
    r.target.set_faults(TargetFaults::default());
    let retry = r.pipeline.rollback(&mut imp).await;
    assert!(retry.success, "{:?}", retry.error);
    assert!(r.target.active().is_empty());
    assert!(drain(&mut rx).is_empty());
    assert_eq!(r.pipeline.status_snapshot().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_rollouts_survive_sibling_rollback() {
    let r = rig();
    let good = candidate(0.9);
    let bad = candidate(0.9);
    let (good_id, bad_id) = (good.id().to_string(), bad.id().to_string());
    r.target.set_faults(TargetFaults { fail_apply_for: Some((bad_id.clone(), 0.5)), ..TargetFaults::default() });

    // `bad` captures its rollback point while `good` is in canary, and fails
    // its full-exposure apply after `good` has reached full exposure.
    let (good, bad) = tokio::join!(r.pipeline.evaluate_one(good), async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        r.pipeline.evaluate_one(bad).await
    });

    assert_eq!(good.status(), &Status::Deployed);
    assert_eq!(bad.status(), &Status::RolledBack);
    assert_eq!(bad.failed_phase(), Some("full"));
    assert_eq!(r.target.active(), vec![good_id.clone()]);
    assert_eq!(r.target.exposure(&good_id), Some(1.0));
    assert_eq!(r.target.exposure(&bad_id), None);
}

#[tokio::test]
async fn test_rollback_of_pending_is_refused() {
    let r = rig();
    let mut imp = candidate(0.9);
    let result = r.pipeline.rollback(&mut imp).await;
    assert!(!result.success);
    assert!(result.severity.is_none());
    assert_eq!(imp.status(), &Status::Pending);
}

// ---------------------------------------------------------------------------
// Harness failures
// ---------------------------------------------------------------------------

struct StuckHarness;

#[async_trait]
impl TestHarness for StuckHarness {
    async fn provision(&self) -> Result<TestEnvironment, HarnessError> {
        Ok(TestEnvironment { id: "stuck".into() })
    }

    async fn apply(&self, _env: &TestEnvironment, _imp: &Improvement) -> Result<(), HarnessError> {
        Ok(())
    }

    async fn run(&self, _env: &TestEnvironment, _suite: &TestSuite) -> Result<SuiteRun, HarnessError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(SuiteRun { metrics: improved(), reliability: 1.0, efficiency: 1.0 })
    }
}

#[tokio::test(start_paused = true)]
async fn test_harness_timeout_fails_the_improvement() {
    let mut config = two_phase_config();
    config.harness.timeout_secs = 10.0;
    let r = rig_with(config, Arc::new(StuckHarness));
    let mut rx = r.pipeline.subscribe();

    let imp = r.pipeline.evaluate_one(candidate(0.9)).await;

    assert_eq!(imp.status(), &Status::Failed);
    assert!(imp.test_results().is_none());
    assert!(imp.outcome_reason().unwrap().starts_with("test error"));
    assert_eq!(drain(&mut rx)[0].name(), "improvement_failed");
}
