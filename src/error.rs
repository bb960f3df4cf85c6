//! # Module: error
//!
//! Crate-level error type. Every fallible surface of the pipeline either
//! returns [`LoopError`] directly or a module-local error that converts into
//! it via `From`.

use thiserror::Error;

use crate::config::ConfigError;
use crate::self_modify::deployment::DeploymentError;
use crate::self_modify::harness::HarnessError;
use crate::sources::http::MetricsSourceError;

/// How loudly an error must be surfaced.
///
/// `Critical` means the live system may be in an inconsistent state and an
/// operator has to look at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Top-level pipeline errors.
#[derive(Error, Debug)]
pub enum LoopError {
    /// An external collaborator (metrics, producer, feedback) could not be reached.
    #[error("{collaborator} unavailable: {detail}")]
    Unavailable { collaborator: String, detail: String },

    /// The HTTP metrics source failed.
    #[error("metrics source: {0}")]
    Metrics(#[from] MetricsSourceError),

    /// The test harness failed while provisioning, applying, or running.
    #[error("test harness: {0}")]
    Harness(#[from] HarnessError),

    /// The deployment state machine failed.
    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    /// A status change that the improvement state machine forbids.
    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// Test results were attached twice to the same improvement.
    #[error("test results already attached to {0}")]
    ResultsAlreadyAttached(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// History persistence failed.
    #[error("history store: {0}")]
    History(String),

    /// Process-level setup (logging, runtime) failed.
    #[error("initialisation failed: {0}")]
    Init(String),
}

impl LoopError {
    /// Shorthand for [`LoopError::Unavailable`].
    pub fn unavailable(collaborator: impl Into<String>, detail: impl Into<String>) -> Self {
        LoopError::Unavailable { collaborator: collaborator.into(), detail: detail.into() }
    }

    /// Classify the error for escalation.
    pub fn severity(&self) -> Severity {
        match self {
            LoopError::Unavailable { .. } | LoopError::Metrics(_) => Severity::Warning,
            LoopError::Deployment(e) if e.is_critical() => Severity::Critical,
            _ => Severity::Error,
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, LoopError>;
