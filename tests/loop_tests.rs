//! Tests for the improvement loop: bounded concurrency, priority ordering,
//! adaptive pacing, error recovery and the stop token.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use improvement_loop::cli::apply_fast;
use improvement_loop::self_modify::deployment::InMemoryTarget;
use improvement_loop::self_modify::harness::{HarnessError, SuiteRun, TestEnvironment, TestHarness, TestSuite};
use improvement_loop::sim::{simulated_pipeline, QueuedFeedback, ScriptedProducer, StaticMetrics};
use improvement_loop::{
    Category, Collaborators, HistoryFilter, Improvement, ImprovementLoop, LoopConfig, LoopEvent, Origin,
    PerformanceMetrics, Pipeline, StatusKind,
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

/// Records concurrency and apply order; every run takes five seconds.
#[derive(Default)]
struct CountingHarness {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    applied: Mutex<Vec<String>>,
}

#[async_trait]
impl TestHarness for CountingHarness {
    async fn provision(&self) -> Result<TestEnvironment, HarnessError> {
        Ok(TestEnvironment { id: uuid::Uuid::new_v4().to_string() })
    }

    async fn apply(&self, _env: &TestEnvironment, imp: &Improvement) -> Result<(), HarnessError> {
        self.applied.lock().unwrap().push(imp.description().to_string());
        Ok(())
    }

    async fn run(&self, _env: &TestEnvironment, _suite: &TestSuite) -> Result<SuiteRun, HarnessError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(SuiteRun { metrics: improved(), reliability: 0.99, efficiency: 1.0 })
    }
}

struct Rig {
    pipeline: Arc<Pipeline>,
    metrics: Arc<StaticMetrics>,
    producer: Arc<ScriptedProducer>,
    harness: Arc<CountingHarness>,
}

fn rig() -> Rig {
    let mut config = LoopConfig::default();
    config.discovery.categories = vec![Category::Ensemble];
    for phase in &mut config.deployment.phases {
        phase.min_duration_secs = 1.0;
        phase.stabilization_secs = 1.0;
    }
    let metrics = Arc::new(StaticMetrics::new(baseline(), baseline()));
    let producer = Arc::new(ScriptedProducer::default());
    let harness = Arc::new(CountingHarness::default());
    let pipeline = Arc::new(Pipeline::new(
        config,
        Collaborators {
            metrics: metrics.clone(),
            producer: producer.clone(),
            harness: harness.clone(),
            target: Arc::new(InMemoryTarget::new("primary")),
            feedback: Arc::new(QueuedFeedback::default()),
        },
    ));
    Rig { pipeline, metrics, producer, harness }
}

fn candidate(desc: &str) -> Improvement {
    Improvement::new(Category::Ensemble, desc, 0.9, 0.08, 0.1)
}

fn names(events: Vec<LoopEvent>) -> Vec<&'static str> {
    events.iter().map(LoopEvent::name).collect()
}

// ---------------------------------------------------------------------------
// Concurrency and priority
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_ten_pending_never_more_than_three_in_flight() {
    let r = rig();
    r.producer.set_routine((0..10).map(|i| candidate(&format!("c{i}"))).collect());
    let mut lp = ImprovementLoop::new(r.pipeline.clone());

    let summary = lp.run_iteration().await.unwrap();

    assert_eq!(summary.discovered, 10);
    assert_eq!(summary.evaluated, 10);
    assert_eq!(r.harness.peak.load(Ordering::SeqCst), 3);
    assert_eq!(r.pipeline.history(&HistoryFilter::new()).len(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_urgent_candidates_run_in_first_batch() {
    let r = rig();
    r.metrics.set_current(PerformanceMetrics::new(0.60, 100.0, 50.0, 0.020));
    r.producer.set_routine((0..5).map(|i| candidate(&format!("routine-{i}"))).collect());
    r.producer.set_urgent(vec![candidate("urgent")]);
    let mut lp = ImprovementLoop::new(r.pipeline.clone());

    let summary = lp.run_iteration().await.unwrap();

    assert!(summary.degraded);
    assert_eq!(summary.urgent, 1);
    let applied = r.harness.applied.lock().unwrap().clone();
    assert_eq!(applied.len(), 6);
    assert!(applied[..3].iter().any(|d| d == "urgent"), "{applied:?}");
    let urgent = r.pipeline.history(&HistoryFilter::new());
    assert_eq!(urgent.iter().filter(|i| i.origin() == Origin::Urgent).count(), 1);
}

/// Panics inside the suite run for any candidate described as "boom".
struct ExplodingHarness;

#[async_trait]
impl TestHarness for ExplodingHarness {
    async fn provision(&self) -> Result<TestEnvironment, HarnessError> {
        Ok(TestEnvironment { id: uuid::Uuid::new_v4().to_string() })
    }

    async fn apply(&self, env: &TestEnvironment, imp: &Improvement) -> Result<(), HarnessError> {
        if imp.description() == "boom" {
            panic!("suite crashed in {}", env.id);
        }
        Ok(())
    }

    async fn run(&self, _env: &TestEnvironment, _suite: &TestSuite) -> Result<SuiteRun, HarnessError> {
        Ok(SuiteRun { metrics: improved(), reliability: 0.99, efficiency: 1.0 })
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_lifecycle_is_recorded_failed() {
    let mut config = LoopConfig::default();
    config.discovery.categories = vec![Category::Ensemble];
    for phase in &mut config.deployment.phases {
        phase.min_duration_secs = 1.0;
        phase.stabilization_secs = 1.0;
    }
    let producer = Arc::new(ScriptedProducer::default());
    producer.set_routine(vec![candidate("boom"), candidate("fine")]);
    let pipeline = Arc::new(Pipeline::new(
        config,
        Collaborators {
            metrics: Arc::new(StaticMetrics::new(baseline(), baseline())),
            producer,
            harness: Arc::new(ExplodingHarness),
            target: Arc::new(InMemoryTarget::new("primary")),
            feedback: Arc::new(QueuedFeedback::default()),
        },
    ));
    let mut rx = pipeline.subscribe();

    let summary = ImprovementLoop::new(pipeline.clone()).run_iteration().await.unwrap();

    assert_eq!(summary.evaluated, 2);
    let failed = pipeline.history(&HistoryFilter::new().status(StatusKind::Failed));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].description(), "boom");
    assert!(failed[0].outcome_reason().unwrap().contains("suite crashed"));
    let status = pipeline.status_snapshot();
    assert_eq!(status.failed, 1);
    assert_eq!(status.deployed, 1);

    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    assert!(events.iter().any(|e| matches!(
        e,
        LoopEvent::ImprovementFailed { improvement, .. } if improvement.description() == "boom"
    )));
}

// ---------------------------------------------------------------------------
// Running loop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_single_iteration_event_sequence() {
    let r = rig();
    r.producer.set_routine(vec![candidate("one")]);
    let mut rx = r.pipeline.subscribe();

    ImprovementLoop::new(r.pipeline.clone()).with_max_iterations(1).spawn().join().await;

    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    assert_eq!(names(events), vec!["loop_started", "improvement_deployed", "loop_stopped"]);
    let status = r.pipeline.status_snapshot();
    assert_eq!(status.iterations, 1);
    assert_eq!(status.deployed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_collaborator_outage_does_not_stop_loop() {
    let r = rig();
    r.metrics.fail_next_current(2);
    r.producer.set_routine(vec![candidate("after outage")]);

    ImprovementLoop::new(r.pipeline.clone()).with_max_iterations(3).spawn().join().await;

    let status = r.pipeline.status_snapshot();
    assert_eq!(status.iterations, 3);
    assert_eq!(status.iteration_errors, 2);
    assert_eq!(status.deployed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_iteration_boundary() {
    let r = rig();
    r.producer.set_routine(vec![candidate("slow")]);
    let handle = r.pipeline.start();

    // Mid-evaluation: the harness run takes five seconds.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(r.harness.in_flight.load(Ordering::SeqCst), 1);
    handle.stop_and_join().await;

    let status = r.pipeline.status_snapshot();
    assert!(!status.running);
    assert_eq!(status.iterations, 1);
    assert_eq!(status.deployed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_drained_queue_interval_uses_performance_reduction() {
    let r = rig();
    r.producer.set_routine(vec![candidate("x")]);
    ImprovementLoop::new(r.pipeline.clone()).with_max_iterations(1).spawn().join().await;
    // Queue drained, performance 1.0 against the refreshed baseline.
    let secs = r.pipeline.status_snapshot().last_interval_secs;
    assert!((secs - 2_520.0).abs() < 1e-6, "{secs}");
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_simulated_pipeline_runs_fast_iterations() {
    let mut config = LoopConfig::default();
    apply_fast(&mut config);
    let pipeline = simulated_pipeline(config, 11);

    ImprovementLoop::new(pipeline.clone()).with_max_iterations(3).spawn().join().await;

    let status = pipeline.status_snapshot();
    assert_eq!(status.iterations, 3);
    assert_eq!(status.iteration_errors, 0);
    let report = pipeline.report();
    assert_eq!(report.total_count, pipeline.history(&HistoryFilter::new()).len());
    assert_eq!(
        report.total_count,
        report.deployed_count + report.rolled_back_count + report.failed_count
    );
}
