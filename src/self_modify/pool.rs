//! # Stage: Evaluation Worker Pool
//!
//! ## Responsibility
//! Drains the [`ImprovementQueue`] in batches of at most `max_concurrent`
//! lifecycles. Each lifecycle runs as its own tokio task; the whole batch is
//! awaited before the next batch is pulled.
//!
//! ## Guarantees
//! - Bounded: never more than `max_concurrent` lifecycles in flight.
//! - Isolated: a panicking lifecycle does not abort its siblings; the
//!   improvement it held is returned in [`Drained::aborted`], settled
//!   `Failed` with the panic as reason.
//! - Priority order: each batch is taken from the head of the queue.
//!
//! ## NOT Responsible For
//! - What a lifecycle does (the caller supplies it)
//! - Persisting outcomes (the caller records [`Drained::aborted`]; completed
//!   lifecycles record themselves)

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::task::JoinSet;

use crate::improvement::{Improvement, Status};
use crate::self_modify::queue::ImprovementQueue;

/// Default concurrency cap.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Per-pass batch launcher.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationPool {
    max_concurrent: usize,
}

/// What one [`EvaluationPool::drain`] settled.
#[derive(Debug, Default)]
pub struct Drained {
    /// Lifecycles that ran to completion, in completion order.
    pub completed: Vec<Improvement>,
    /// Improvements whose lifecycle panicked.
    pub aborted: Vec<Improvement>,
}

impl Drained {
    pub fn len(&self) -> usize {
        self.completed.len() + self.aborted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EvaluationPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl EvaluationPool {
    /// `max_concurrent` is clamped to at least 1.
    pub fn new(max_concurrent: usize) -> Self {
        Self { max_concurrent: max_concurrent.max(1) }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run `lifecycle` over every queued improvement, batch by batch.
    pub async fn drain<F, Fut>(&self, queue: &mut ImprovementQueue, lifecycle: F) -> Drained
    where
        F: Fn(Improvement) -> Fut,
        Fut: Future<Output = Improvement> + Send + 'static,
    {
        let mut drained = Drained { completed: Vec::with_capacity(queue.len()), aborted: Vec::new() };
        let mut pass = 0usize;

        while !queue.is_empty() {
            pass += 1;
            let batch = queue.drain_batch(self.max_concurrent);
            tracing::debug!(
                target: "self_modify::pool",
                pass,
                batch = batch.len(),
                remaining = queue.len(),
                "launching batch"
            );

            let mut set = JoinSet::new();
            for imp in batch {
                let snapshot = imp.clone();
                let run = AssertUnwindSafe(lifecycle(imp)).catch_unwind();
                set.spawn(async move { (snapshot, run.await) });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(imp))) => drained.completed.push(imp),
                    Ok((mut imp, Err(payload))) => {
                        let reason = format!("evaluation task panicked: {}", panic_message(payload.as_ref()));
                        tracing::error!(target: "self_modify::pool", id = %imp.id(), reason = %reason, "lifecycle aborted");
                        if let Err(e) = imp.settle(Status::Failed, reason) {
                            tracing::error!(target: "self_modify::pool", error = %e, "could not mark aborted lifecycle failed");
                        }
                        drained.aborted.push(imp);
                    }
                    // Only reachable if the runtime is shutting down.
                    Err(e) => tracing::error!(target: "self_modify::pool", error = %e, "evaluation task lost"),
                }
            }
        }

        drained
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
