//! # Improvement Loop
//!
//! The long-running task that closes the continuous-improvement cycle:
//!
//! ```text
//!  MetricsSource ──► DegradationDetector ──► urgent candidates (×2.0) ─┐
//!                                                                     ▼
//!  CandidateProducer ──► discovery filter ──► routine (×1.0) ──► ImprovementQueue
//!                                                                     │
//!  FeedbackSource ──► feedback candidates (×1.5, next pass) ──────────┤
//!                                                                     ▼
//!                    EvaluationPool (≤ max_concurrent) ──► Pipeline::evaluate_one
//!                                                                     │
//!               AdaptiveInterval ◄── queue length + live performance ─┘
//! ```
//!
//! ## What It Does
//!
//! 1. Checks live metrics against the pinned baseline; a degradation enqueues
//!    urgent candidates ahead of everything else.
//! 2. Runs routine discovery and enqueues the survivors.
//! 3. Drains the queue through the bounded worker pool.
//! 4. Collects user feedback; its candidates wait for the next pass.
//! 5. Sleeps for the adaptive interval, or `error_backoff` after a failed pass.
//!
//! A failed pass never stops the loop. Only the stop token does, and only at
//! an iteration boundary: lifecycles already in flight run to completion.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use improvement_loop::sim::simulated_pipeline;
//! use improvement_loop::LoopConfig;
//!
//! let pipeline = simulated_pipeline(LoopConfig::default(), 7);
//! let handle = pipeline.start();
//! // …
//! handle.stop_and_join().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::events::LoopEvent;
use crate::pipeline::Pipeline;
use crate::self_modify::pool::EvaluationPool;
use crate::self_modify::queue::ImprovementQueue;
use crate::self_tune::pacing::{performance_factor, AdaptiveInterval};

// ---------------------------------------------------------------------------
// IterationSummary
// ---------------------------------------------------------------------------

/// What one pass of the loop did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub degraded: bool,
    pub urgent: usize,
    pub discovered: usize,
    pub evaluated: usize,
    pub feedback: usize,
    /// Performance factor in `[0, 1]` fed to the pacing policy.
    pub performance: f64,
    /// Queue length left for the next pass.
    pub queue_len: usize,
}

// ---------------------------------------------------------------------------
// ImprovementLoop
// ---------------------------------------------------------------------------

/// The loop controller. Owns the queue; shares the pipeline with its workers.
pub struct ImprovementLoop {
    pipeline: Arc<Pipeline>,
    /// Priority queue (owned by the loop task, not shared).
    queue: ImprovementQueue,
    pool: EvaluationPool,
    pacing: AdaptiveInterval,
    error_backoff: Duration,
    /// Stop after this many passes. `None` runs until stopped.
    max_iterations: Option<u64>,
}

impl ImprovementLoop {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let timing = &pipeline.config().timing;
        Self {
            queue: ImprovementQueue::new(),
            pool: EvaluationPool::new(timing.max_concurrent),
            pacing: AdaptiveInterval::from(timing),
            error_backoff: timing.error_backoff(),
            max_iterations: None,
            pipeline,
        }
    }

    pub fn with_max_iterations(mut self, n: u64) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Spawn [`ImprovementLoop::run`] on the current runtime.
    pub fn spawn(self) -> LoopHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        LoopHandle { stop_tx, task }
    }

    /// One pass: detect, discover, evaluate, integrate feedback.
    ///
    /// # Errors
    /// Any collaborator failure before or after the drain. Lifecycle failures
    /// are recorded in history and do not fail the pass.
    pub async fn run_iteration(&mut self) -> Result<IterationSummary> {
        let mut summary = IterationSummary::default();

        let report = self.pipeline.check_degradation().await?;
        summary.degraded = report.degraded;
        summary.performance = performance_factor(&report.current, &report.baseline);
        if report.degraded {
            for imp in self.pipeline.synthesize_urgent(&report).await? {
                let priority = imp.priority();
                self.queue.enqueue(imp, priority);
                summary.urgent += 1;
            }
        }

        for imp in self.pipeline.discover().await? {
            let priority = imp.priority();
            self.queue.enqueue(imp, priority);
            summary.discovered += 1;
        }

        let pipeline = Arc::clone(&self.pipeline);
        let settled = self
            .pool
            .drain(&mut self.queue, move |imp| {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.evaluate_one(imp).await }
            })
            .await;
        summary.evaluated = settled.len();
        for imp in &settled.aborted {
            self.pipeline.record_aborted(imp);
        }

        for imp in self.pipeline.feedback_candidates().await? {
            let priority = imp.priority();
            self.queue.enqueue(imp, priority);
            summary.feedback += 1;
        }

        summary.queue_len = self.queue.len();
        tracing::info!(
            target: "self_tune::orchestrator",
            degraded = summary.degraded,
            urgent = summary.urgent,
            discovered = summary.discovered,
            evaluated = summary.evaluated,
            feedback = summary.feedback,
            performance = summary.performance,
            "iteration complete"
        );
        Ok(summary)
    }

    /// Run until the stop token flips to `true`, its sender is dropped, or
    /// `max_iterations` passes have completed.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        self.pipeline.status_mut().running = true;
        self.pipeline.emit(LoopEvent::LoopStarted);
        tracing::info!(
            target: "self_tune::orchestrator",
            max_concurrent = self.pool.max_concurrent(),
            "improvement loop started"
        );

        let mut completed = 0u64;
        loop {
            if *stop.borrow_and_update() {
                break;
            }

            let wait = match self.run_iteration().await {
                Ok(summary) => self.pacing.next(summary.queue_len, summary.performance),
                Err(e) => {
                    tracing::error!(
                        target: "self_tune::orchestrator",
                        error = %e,
                        severity = %e.severity(),
                        backoff_secs = self.error_backoff.as_secs_f64(),
                        "iteration failed"
                    );
                    self.pipeline.iteration_failed(&e);
                    self.error_backoff
                }
            };
            self.pipeline.iteration_done(self.queue.len(), wait);

            completed += 1;
            if self.max_iterations.is_some_and(|max| completed >= max) {
                break;
            }

            tracing::debug!(target: "self_tune::orchestrator", wait_secs = wait.as_secs_f64(), "sleeping");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.pipeline.status_mut().running = false;
        self.pipeline.emit(LoopEvent::LoopStopped);
        tracing::info!(target: "self_tune::orchestrator", iterations = completed, "improvement loop stopped");
    }
}

// ---------------------------------------------------------------------------
// LoopHandle
// ---------------------------------------------------------------------------

/// Owner-side handle of a spawned loop.
pub struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    /// Ask the loop to stop at its next iteration boundary.
    pub fn stop(&self) {
        // The loop may already have exited on its own.
        let _ = self.stop_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(target: "self_tune::orchestrator", error = %e, "loop task ended abnormally");
        }
    }

    pub async fn stop_and_join(self) {
        self.stop();
        self.join().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
