//! # Module: sources
//!
//! Contracts for the external collaborators the loop consumes. Each is an
//! object-safe async trait so heterogeneous implementations can be held as
//! `Arc<dyn …>`.
//!
//! ## Sub-modules
//! - [`http`]: `MetricsSource` backed by a JSON HTTP endpoint

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::improvement::{Category, Improvement};
use crate::metrics::PerformanceMetrics;
use crate::self_tune::degradation::DegradationReport;

/// Supplies the current and baseline performance snapshots on demand.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn current(&self) -> Result<PerformanceMetrics>;
    async fn baseline(&self) -> Result<PerformanceMetrics>;
}

/// Supplies raw candidate improvements.
#[async_trait]
pub trait CandidateProducer: Send + Sync {
    /// Routine candidates for one category.
    async fn produce(&self, category: &Category) -> Result<Vec<Improvement>>;

    /// Candidates aimed at the regressed dimensions in `report`.
    async fn produce_for_degradation(&self, report: &DegradationReport) -> Result<Vec<Improvement>>;

    /// Candidates derived from user feedback.
    async fn produce_from_feedback(&self, items: &[FeedbackItem]) -> Result<Vec<Improvement>>;
}

/// One piece of user feedback about the live system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub id: String,
    /// Category the feedback points at, when the user named one.
    pub category: Option<Category>,
    pub message: String,
    /// User rating in `[0, 1]`, lower is worse.
    pub rating: f64,
    pub submitted_at_ms: u64,
}

/// Supplies pending user feedback. Each item is returned once.
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    async fn collect(&self) -> Result<Vec<FeedbackItem>>;
}

/// A `FeedbackSource` that never has anything to say.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFeedback;

#[async_trait]
impl FeedbackSource for NoFeedback {
    async fn collect(&self) -> Result<Vec<FeedbackItem>> {
        Ok(Vec::new())
    }
}
