//! # Module: sim
//!
//! ## Responsibility
//! Self-contained collaborators so the loop can run without a live system:
//! the CLI demo uses the seeded random ones, tests use the scripted ones.
//!
//! | Type                | Implements          | Behaviour                                  |
//! |---------------------|---------------------|--------------------------------------------|
//! | `SimulatedMetrics`  | `MetricsSource`     | seeded random walk around the baseline     |
//! | `StaticMetrics`     | `MetricsSource`     | fixed snapshots, injectable failures       |
//! | `SimulatedProducer` | `CandidateProducer` | seeded random candidates                   |
//! | `ScriptedProducer`  | `CandidateProducer` | returns exactly what it was given          |
//! | `SimulatedHarness`  | `TestHarness`       | gain-scaled or fixed suite results         |
//! | `QueuedFeedback`    | `FeedbackSource`    | hands out each pushed item once            |
//!
//! ## Guarantees
//! - The same seed yields the same sequence of snapshots and candidates.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::improvement::{Category, Improvement};
use crate::metrics::{Dimension, PerformanceMetrics};
use crate::pipeline::{Collaborators, Pipeline};
use crate::self_modify::deployment::InMemoryTarget;
use crate::self_modify::harness::{HarnessError, SuiteRun, TestEnvironment, TestHarness, TestSuite};
use crate::self_tune::degradation::DegradationReport;
use crate::sources::{CandidateProducer, FeedbackItem, FeedbackSource, MetricsSource};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply a fractional gain in the "better" direction of every dimension.
fn scaled(m: &PerformanceMetrics, gain: f64) -> PerformanceMetrics {
    PerformanceMetrics::new(
        m.accuracy * (1.0 + gain),
        m.latency / (1.0 + gain),
        m.throughput * (1.0 + gain),
        m.error_rate / (1.0 + gain),
    )
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Seeded random walk around a starting level.
pub struct SimulatedMetrics {
    baseline: PerformanceMetrics,
    level: Mutex<PerformanceMetrics>,
    rng: Mutex<StdRng>,
    /// Largest per-read drift as a fraction (default 0.03).
    volatility: f64,
}

impl SimulatedMetrics {
    pub fn new(baseline: PerformanceMetrics, seed: u64) -> Self {
        Self {
            baseline,
            level: Mutex::new(baseline),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            volatility: 0.03,
        }
    }

    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility.abs();
        self
    }
}

#[async_trait]
impl MetricsSource for SimulatedMetrics {
    async fn current(&self) -> Result<PerformanceMetrics> {
        let drift = {
            let mut rng = lock(&self.rng);
            if self.volatility > 0.0 { rng.gen_range(-self.volatility..self.volatility) } else { 0.0 }
        };
        let mut level = lock(&self.level);
        *level = scaled(&level, drift).sanitized();
        Ok(*level)
    }

    async fn baseline(&self) -> Result<PerformanceMetrics> {
        Ok(self.baseline)
    }
}

/// Fixed snapshots. `fail_next_current(n)` and `fail_next_baseline(n)` make
/// the next `n` reads of that snapshot fail.
pub struct StaticMetrics {
    baseline: Mutex<PerformanceMetrics>,
    current: Mutex<PerformanceMetrics>,
    failures: AtomicUsize,
    baseline_failures: AtomicUsize,
}

impl StaticMetrics {
    pub fn new(baseline: PerformanceMetrics, current: PerformanceMetrics) -> Self {
        Self {
            baseline: Mutex::new(baseline),
            current: Mutex::new(current),
            failures: AtomicUsize::new(0),
            baseline_failures: AtomicUsize::new(0),
        }
    }

    pub fn set_current(&self, m: PerformanceMetrics) {
        *lock(&self.current) = m;
    }

    pub fn set_baseline(&self, m: PerformanceMetrics) {
        *lock(&self.baseline) = m;
    }

    pub fn fail_next_current(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_baseline(&self, n: usize) {
        self.baseline_failures.store(n, Ordering::SeqCst);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

#[async_trait]
impl MetricsSource for StaticMetrics {
    async fn current(&self) -> Result<PerformanceMetrics> {
        if take_failure(&self.failures) {
            return Err(LoopError::unavailable("metrics", "injected failure"));
        }
        Ok(*lock(&self.current))
    }

    async fn baseline(&self) -> Result<PerformanceMetrics> {
        if take_failure(&self.baseline_failures) {
            return Err(LoopError::unavailable("metrics", "injected baseline failure"));
        }
        Ok(*lock(&self.baseline))
    }
}

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

/// Seeded random candidates.
pub struct SimulatedProducer {
    rng: Mutex<StdRng>,
    per_category: usize,
}

impl SimulatedProducer {
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)), per_category: 2 }
    }

    pub fn with_per_category(mut self, n: usize) -> Self {
        self.per_category = n;
        self
    }

    fn candidate(&self, category: Category, description: String) -> Improvement {
        let mut rng = lock(&self.rng);
        let confidence = rng.gen_range(0.5..1.0);
        let gain = rng.gen_range(0.0..0.15);
        let risk = rng.gen_range(0.0..0.6);
        Improvement::new(category, description, confidence, gain, risk)
    }
}

#[async_trait]
impl CandidateProducer for SimulatedProducer {
    async fn produce(&self, category: &Category) -> Result<Vec<Improvement>> {
        Ok((0..self.per_category)
            .map(|i| self.candidate(category.clone(), format!("{category} tweak #{i}")))
            .collect())
    }

    async fn produce_for_degradation(&self, report: &DegradationReport) -> Result<Vec<Improvement>> {
        Ok(report
            .violated_dimensions()
            .into_iter()
            .map(|d| {
                let category = match d {
                    Dimension::Accuracy => Category::Architecture,
                    Dimension::Latency | Dimension::Throughput => Category::Hyperparameters,
                    Dimension::ErrorRate => Category::Regularization,
                };
                self.candidate(category, format!("recover {d}"))
            })
            .collect())
    }

    async fn produce_from_feedback(&self, items: &[FeedbackItem]) -> Result<Vec<Improvement>> {
        Ok(items
            .iter()
            .filter(|f| f.rating < 0.5)
            .map(|f| {
                let category = f.category.clone().unwrap_or(Category::FeatureEngineering);
                self.candidate(category, format!("address feedback {}: {}", f.id, f.message))
            })
            .collect())
    }
}

/// Returns the configured candidates, each with a fresh id per call.
#[derive(Default)]
pub struct ScriptedProducer {
    routine: Mutex<Vec<Improvement>>,
    urgent: Mutex<Vec<Improvement>>,
    feedback: Mutex<Vec<Improvement>>,
}

impl ScriptedProducer {
    pub fn set_routine(&self, candidates: Vec<Improvement>) {
        *lock(&self.routine) = candidates;
    }

    pub fn set_urgent(&self, candidates: Vec<Improvement>) {
        *lock(&self.urgent) = candidates;
    }

    pub fn set_feedback(&self, candidates: Vec<Improvement>) {
        *lock(&self.feedback) = candidates;
    }

    fn fresh(list: &Mutex<Vec<Improvement>>) -> Vec<Improvement> {
        lock(list)
            .iter()
            .map(|i| i.clone().with_id(uuid::Uuid::new_v4().to_string()))
            .collect()
    }
}

#[async_trait]
impl CandidateProducer for ScriptedProducer {
    async fn produce(&self, _category: &Category) -> Result<Vec<Improvement>> {
        Ok(Self::fresh(&self.routine))
    }

    async fn produce_for_degradation(&self, _report: &DegradationReport) -> Result<Vec<Improvement>> {
        Ok(Self::fresh(&self.urgent))
    }

    async fn produce_from_feedback(&self, _items: &[FeedbackItem]) -> Result<Vec<Improvement>> {
        Ok(Self::fresh(&self.feedback))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

enum HarnessMode {
    /// Every run returns the same suite result.
    Fixed(SuiteRun),
    /// Measured metrics are the reference scaled by the candidate's expected
    /// gain with noise.
    Seeded { reference: PerformanceMetrics, rng: Mutex<StdRng> },
}

/// A `TestHarness` that never touches real infrastructure.
pub struct SimulatedHarness {
    mode: HarnessMode,
    next_env: AtomicUsize,
    /// Expected gain of the candidate applied in each environment.
    applied: Mutex<HashMap<String, f64>>,
}

impl SimulatedHarness {
    pub fn fixed(metrics: PerformanceMetrics, reliability: f64, efficiency: f64) -> Self {
        Self::with_mode(HarnessMode::Fixed(SuiteRun { metrics, reliability, efficiency }))
    }

    pub fn seeded(reference: PerformanceMetrics, seed: u64) -> Self {
        Self::with_mode(HarnessMode::Seeded { reference, rng: Mutex::new(StdRng::seed_from_u64(seed)) })
    }

    fn with_mode(mode: HarnessMode) -> Self {
        Self { mode, next_env: AtomicUsize::new(0), applied: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl TestHarness for SimulatedHarness {
    async fn provision(&self) -> std::result::Result<TestEnvironment, HarnessError> {
        let n = self.next_env.fetch_add(1, Ordering::Relaxed);
        Ok(TestEnvironment { id: format!("sim-env-{n}") })
    }

    async fn apply(&self, env: &TestEnvironment, improvement: &Improvement) -> std::result::Result<(), HarnessError> {
        lock(&self.applied).insert(env.id.clone(), improvement.expected_gain());
        Ok(())
    }

    async fn run(&self, env: &TestEnvironment, _suite: &TestSuite) -> std::result::Result<SuiteRun, HarnessError> {
        match &self.mode {
            HarnessMode::Fixed(run) => Ok(*run),
            HarnessMode::Seeded { reference, rng } => {
                let gain = lock(&self.applied).get(&env.id).copied().unwrap_or(0.0);
                let mut rng = lock(rng);
                let realised = gain * rng.gen_range(0.4..1.4);
                Ok(SuiteRun {
                    metrics: scaled(reference, realised),
                    reliability: rng.gen_range(0.9..1.0),
                    efficiency: rng.gen_range(0.95..1.2),
                })
            }
        }
    }

    async fn teardown(&self, env: &TestEnvironment) -> std::result::Result<(), HarnessError> {
        lock(&self.applied).remove(&env.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// In-memory feedback inbox.
#[derive(Default)]
pub struct QueuedFeedback {
    pending: Mutex<VecDeque<FeedbackItem>>,
}

impl QueuedFeedback {
    pub fn push(&self, item: FeedbackItem) {
        lock(&self.pending).push_back(item);
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FeedbackSource for QueuedFeedback {
    async fn collect(&self) -> Result<Vec<FeedbackItem>> {
        Ok(lock(&self.pending).drain(..).collect())
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Reference level the simulation starts from.
pub fn reference_metrics() -> PerformanceMetrics {
    PerformanceMetrics::new(0.90, 120.0, 40.0, 0.02)
}

/// A pipeline wired entirely to simulated collaborators.
pub fn simulated_pipeline(config: LoopConfig, seed: u64) -> Arc<Pipeline> {
    simulated_pipeline_with_feedback(config, seed, Arc::new(QueuedFeedback::default()))
}

pub fn simulated_pipeline_with_feedback(config: LoopConfig, seed: u64, feedback: Arc<QueuedFeedback>) -> Arc<Pipeline> {
    let reference = reference_metrics();
    let collaborators = Collaborators {
        metrics: Arc::new(SimulatedMetrics::new(reference, seed)),
        producer: Arc::new(SimulatedProducer::new(seed.wrapping_add(1))),
        harness: Arc::new(SimulatedHarness::seeded(reference, seed.wrapping_add(2))),
        target: Arc::new(InMemoryTarget::new("simulated")),
        feedback,
    };
    Arc::new(Pipeline::new(config, collaborators))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
