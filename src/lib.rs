//! # improvement-loop
//!
//! A continuous-improvement control loop for a live model or service.
//!
//! Each iteration compares live metrics with a pinned baseline, discovers
//! candidate improvements (urgently when performance has degraded), tests
//! them in isolation through a bounded worker pool, decides whether each may
//! ship, and rolls the accepted ones out in phases with automatic rollback
//! when a phase's quality gate fails. Every outcome lands in a queryable
//! history and on a broadcast event bus.
//!
//! ## Layout
//! - [`pipeline`]: the operational surface (discover, test, deploy, roll back, report)
//! - [`self_tune`]: degradation detection, adaptive pacing, the loop task
//! - [`self_modify`]: queue, worker pool, harness, decision, rollout, history
//! - [`sources`]: collaborator contracts (metrics, candidates, feedback)
//! - [`sim`]: seeded simulated collaborators
//! - [`events`], [`config`], [`error`]

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod improvement;
pub mod metrics;
pub mod pipeline;
pub mod self_modify;
pub mod self_tune;
pub mod sim;
pub mod sources;

use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::EnvFilter;

pub use config::LoopConfig;
pub use error::{LoopError, Result, Severity};
pub use events::LoopEvent;
pub use improvement::{Category, Improvement, Origin, Status, StatusKind, TestResults};
pub use metrics::PerformanceMetrics;
pub use pipeline::{Collaborators, LoopStatus, Pipeline};
pub use self_modify::memory::{HistoryFilter, ImprovementReport};
pub use self_tune::orchestrator::{ImprovementLoop, IterationSummary, LoopHandle};

/// Milliseconds since the Unix epoch. `0` if the clock is before 1970.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Initialise the global tracing subscriber.
///
/// `LOG_FORMAT=json` selects structured JSON output; anything else gives
/// human-readable output. The filter comes from `RUST_LOG` and defaults to
/// `info`.
///
/// # Errors
/// [`LoopError::Init`] if a global subscriber is already installed.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init(),
    };
    result.map_err(|e| LoopError::Init(e.to_string()))
}
