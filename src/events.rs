//! # Stage: Event Bus
//!
//! ## Responsibility
//! Typed notifications emitted by the loop and the lifecycle stages, fanned
//! out to any number of subscribers over a `tokio::sync::broadcast` channel.
//!
//! ## Guarantees
//! - Non-blocking: [`EventBus::emit`] never waits; with no subscribers the
//!   event is dropped.
//! - Bounded: the channel holds at most `capacity` events; slow subscribers
//!   observe `RecvError::Lagged` rather than stalling the loop.
//! - Thread-safe: `EventBus` is `Send + Sync` and cheap to share behind `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Severity;
use crate::improvement::Improvement;
use crate::metrics::PerformanceMetrics;

/// Default broadcast channel capacity.
pub const EVENT_CHANNEL_CAP: usize = 256;

/// Everything the pipeline announces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    LoopStarted,
    LoopStopped,
    DegradationDetected {
        current: PerformanceMetrics,
        baseline: PerformanceMetrics,
    },
    ImprovementDeployed {
        improvement: Box<Improvement>,
        duration_ms: u64,
    },
    ImprovementRolledBack {
        improvement: Box<Improvement>,
        duration_ms: u64,
        reason: String,
    },
    ImprovementRejected {
        improvement: Box<Improvement>,
        reason: String,
    },
    /// Test error, or a rollback that could not begin or not be verified.
    ImprovementFailed {
        improvement: Box<Improvement>,
        reason: String,
        severity: Severity,
    },
    LoopError {
        error: String,
        timestamp_ms: u64,
    },
}

impl LoopEvent {
    /// Short machine-friendly name of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            LoopEvent::LoopStarted => "loop_started",
            LoopEvent::LoopStopped => "loop_stopped",
            LoopEvent::DegradationDetected { .. } => "degradation_detected",
            LoopEvent::ImprovementDeployed { .. } => "improvement_deployed",
            LoopEvent::ImprovementRolledBack { .. } => "improvement_rolled_back",
            LoopEvent::ImprovementRejected { .. } => "improvement_rejected",
            LoopEvent::ImprovementFailed { .. } => "improvement_failed",
            LoopEvent::LoopError { .. } => "loop_error",
        }
    }
}

/// Broadcast hub for [`LoopEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LoopEvent>,
    emitted: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAP)
    }
}

impl EventBus {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, emitted: AtomicU64::new(0) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LoopEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "events", event = event.name(), "emit");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    /// Total events emitted since construction.
    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
