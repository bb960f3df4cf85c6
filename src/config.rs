//! # Module: config
//!
//! ## Responsibility
//! Declarative configuration for the improvement loop: pacing, detector
//! tolerance, discovery filters, deployment decision thresholds, the phased
//! rollout plan, and harness settings. Parsed from TOML and validated before
//! use.
//!
//! ```toml
//! [loop]
//! base_interval_secs = 3600
//! max_concurrent = 3
//!
//! [decision]
//! min_confidence = 0.8
//!
//! [[deployment.phases]]
//! name = "canary"
//! exposure = 0.1
//! min_duration_secs = 300
//! stabilization_secs = 120
//! ```
//!
//! ## Guarantees
//! - Every field has a documented default; an empty file is a valid config.
//! - A config returned by [`load_from_str`] / [`load_from_file`] has passed
//!   [`LoopConfig::validate`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::improvement::Category;
use crate::self_modify::deployment::DeploymentPhase;
use crate::self_modify::gate::{DecisionCriteria, QualityGate};

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced while loading or validating a [`LoopConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: toml::de::Error,
    },

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField { field: String, value: String, reason: String },

    /// One or more fields failed validation.
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField { field: field.into(), value: value.to_string(), reason: reason.into() }
}

/// Convert a seconds value that has already been validated into a `Duration`.
pub(crate) fn secs(v: f64) -> Duration {
    Duration::try_from_secs_f64(v).unwrap_or(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Loop timing and concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between iterations before adaptive shrinking (default 1 h).
    pub base_interval_secs: f64,
    /// Lower clamp of the adaptive interval (default 10 min).
    pub min_interval_secs: f64,
    /// Upper clamp of the adaptive interval (default 2 h).
    pub max_interval_secs: f64,
    /// Wait after a failed iteration (default 60 s).
    pub error_backoff_secs: f64,
    /// Improvements evaluated concurrently per batch (default 3).
    pub max_concurrent: usize,
    /// Queue length at which the backlog reduction saturates (default 10).
    pub backlog_saturation: usize,
    /// Largest interval reduction contributed by the backlog (default 0.5).
    pub max_backlog_reduction: f64,
    /// Largest interval reduction contributed by performance (default 0.3).
    pub max_performance_reduction: f64,
    /// Capacity of the event broadcast channel (default 256).
    pub event_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 3_600.0,
            min_interval_secs: 600.0,
            max_interval_secs: 7_200.0,
            error_backoff_secs: 60.0,
            max_concurrent: 3,
            backlog_saturation: 10,
            max_backlog_reduction: 0.5,
            max_performance_reduction: 0.3,
            event_capacity: 256,
        }
    }
}

impl TimingConfig {
    pub fn base_interval(&self) -> Duration { secs(self.base_interval_secs) }
    pub fn min_interval(&self) -> Duration { secs(self.min_interval_secs) }
    pub fn max_interval(&self) -> Duration { secs(self.max_interval_secs) }
    pub fn error_backoff(&self) -> Duration { secs(self.error_backoff_secs) }
}

/// Degradation detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Relative tolerance per dimension (0.05 = 5%).
    pub tolerance: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { tolerance: 0.05 }
    }
}

/// Routine-discovery filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Candidates need `confidence >` this (default 0.6).
    pub min_confidence: f64,
    /// Candidates need `expected_gain >` this (default 0.02).
    pub min_gain: f64,
    /// Candidates need `risk_level <` this (default 0.5).
    pub max_risk: f64,
    /// Categories polled each iteration (default: all built-in).
    pub categories: Vec<Category>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            min_gain: 0.02,
            max_risk: 0.5,
            categories: Category::BUILTIN.to_vec(),
        }
    }
}

/// Phased rollout plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub phases: Vec<DeploymentPhase>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            phases: vec![
                DeploymentPhase::new("canary", 0.10, 300.0, 120.0, QualityGate::with_tolerance(0.02)),
                DeploymentPhase::new("rolling_out", 0.50, 900.0, 300.0, QualityGate::with_tolerance(0.03)),
                DeploymentPhase::new("full", 1.00, 1_800.0, 600.0, QualityGate::with_tolerance(0.05)),
            ],
        }
    }
}

/// Test harness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Name of the suite handed to the harness.
    pub suite: String,
    /// Upper bound on one suite run (default 30 min).
    pub timeout_secs: f64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self { suite: "regression".into(), timeout_secs: 1_800.0 }
    }
}

impl HarnessConfig {
    pub fn timeout(&self) -> Duration { secs(self.timeout_secs) }
}

// ---------------------------------------------------------------------------
// LoopConfig
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    #[serde(rename = "loop")]
    pub timing: TimingConfig,
    pub detector: DetectorConfig,
    pub discovery: DiscoveryConfig,
    pub decision: DecisionCriteria,
    pub deployment: DeploymentConfig,
    pub harness: HarnessConfig,
}

impl LoopConfig {
    /// Check every semantic constraint, collecting all violations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let t = &self.timing;

        for (field, v) in [
            ("loop.base_interval_secs", t.base_interval_secs),
            ("loop.min_interval_secs", t.min_interval_secs),
            ("loop.max_interval_secs", t.max_interval_secs),
            ("loop.error_backoff_secs", t.error_backoff_secs),
            ("harness.timeout_secs", self.harness.timeout_secs),
        ] {
            if !v.is_finite() || v < 0.0 {
                errors.push(invalid(field, v, "must be a finite, non-negative number of seconds"));
            }
        }
        if t.min_interval_secs > t.max_interval_secs {
            errors.push(invalid("loop.min_interval_secs", t.min_interval_secs, "must be <= max_interval_secs"));
        }
        if t.max_concurrent == 0 {
            errors.push(invalid("loop.max_concurrent", 0, "must be at least 1"));
        }
        if t.backlog_saturation == 0 {
            errors.push(invalid("loop.backlog_saturation", 0, "must be at least 1"));
        }
        if t.event_capacity == 0 {
            errors.push(invalid("loop.event_capacity", 0, "must be at least 1"));
        }
        for (field, v) in [
            ("loop.max_backlog_reduction", t.max_backlog_reduction),
            ("loop.max_performance_reduction", t.max_performance_reduction),
            ("detector.tolerance", self.detector.tolerance),
        ] {
            if !(0.0..1.0).contains(&v) {
                errors.push(invalid(field, v, "must be in [0, 1)"));
            }
        }
        if self.discovery.categories.is_empty() {
            errors.push(invalid("discovery.categories", "[]", "at least one category is required"));
        }
        if self.deployment.phases.is_empty() {
            errors.push(invalid("deployment.phases", "[]", "a rollout plan needs at least one phase"));
        }
        for (i, phase) in self.deployment.phases.iter().enumerate() {
            if let Err(reason) = phase.validate() {
                errors.push(invalid(&format!("deployment.phases[{i}]"), &phase.name, &reason));
            }
        }

        match errors.len() {
            0 => Ok(()),
            _ => Err(ConfigError::Validation(errors)),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and validate a [`LoopConfig`] from a TOML file.
pub fn load_from_file(path: &Path) -> Result<LoopConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;
    load_from_str(&content, &path.display().to_string())
}

/// Load and validate a [`LoopConfig`] from TOML text. `source_name` appears
/// in parse errors.
pub fn load_from_str(content: &str, source_name: &str) -> Result<LoopConfig, ConfigError> {
    let config: LoopConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
