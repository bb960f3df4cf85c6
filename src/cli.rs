use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use colored::*;

use crate::config::LoopConfig;
use crate::events::LoopEvent;
use crate::error::Severity;
use crate::self_modify::memory::ImprovementReport;

/// How events are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventFormat {
    /// One colored line per event.
    Pretty,
    /// One JSON object per line.
    Json,
    /// Do not print events.
    Off,
}

#[derive(Parser, Debug)]
#[command(name = "improvement-loop")]
#[command(version = "0.3.0")]
#[command(about = "Continuous improvement loop: detect degradation, test candidates, roll out in phases")]
pub struct Args {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Iterations to run; 0 runs until Ctrl-C
    #[arg(long, short = 'n', default_value = "3")]
    pub iterations: u64,

    /// Seed for the simulated collaborators
    #[arg(long, default_value = "7")]
    pub seed: u64,

    /// Read live metrics from this HTTP endpoint instead of simulating them
    #[arg(long)]
    pub metrics_url: Option<String>,

    /// Shrink every interval and phase duration for a quick demo
    #[arg(long)]
    pub fast: bool,

    /// Queue a piece of user feedback before starting (repeatable)
    #[arg(long = "feedback")]
    pub feedback: Vec<String>,

    /// Event output format
    #[arg(long, value_enum, default_value = "pretty")]
    pub events: EventFormat,

    /// Print the improvement report as JSON on exit
    #[arg(long)]
    pub report: bool,

    /// Mirror the history into this SQLite database
    #[cfg(feature = "sqlite-log")]
    #[arg(long)]
    pub history_db: Option<PathBuf>,
}

/// Scale every duration in `config` down by 1000× for demos.
pub fn apply_fast(config: &mut LoopConfig) {
    const FACTOR: f64 = 1_000.0;
    let t = &mut config.timing;
    t.base_interval_secs /= FACTOR;
    t.min_interval_secs /= FACTOR;
    t.max_interval_secs /= FACTOR;
    t.error_backoff_secs /= FACTOR;
    config.harness.timeout_secs /= FACTOR;
    for phase in &mut config.deployment.phases {
        phase.min_duration_secs /= FACTOR;
        phase.stabilization_secs /= FACTOR;
    }
}

fn severity_label(severity: Severity) -> ColoredString {
    match severity {
        Severity::Warning => "warning".yellow(),
        Severity::Error => "error".red(),
        Severity::Critical => "CRITICAL".red().bold(),
    }
}

/// One human-readable line for `event`.
pub fn format_event(event: &LoopEvent) -> String {
    match event {
        LoopEvent::LoopStarted => format!("{} loop started", "▶".green()),
        LoopEvent::LoopStopped => format!("{} loop stopped", "■".dimmed()),
        LoopEvent::DegradationDetected { current, baseline } => format!(
            "{} degradation: accuracy {:.3} (baseline {:.3}), latency {:.1} (baseline {:.1})",
            "!".yellow().bold(),
            current.accuracy,
            baseline.accuracy,
            current.latency,
            baseline.latency
        ),
        LoopEvent::ImprovementDeployed { improvement, duration_ms } => format!(
            "{} deployed   [{}] {} in {} ms",
            "✔".green(),
            improvement.category(),
            improvement.description().bold(),
            duration_ms
        ),
        LoopEvent::ImprovementRolledBack { improvement, reason, .. } => format!(
            "{} rolled back [{}] {}: {}",
            "↶".yellow(),
            improvement.category(),
            improvement.description(),
            reason.dimmed()
        ),
        LoopEvent::ImprovementRejected { improvement, reason } => format!(
            "{} rejected   [{}] {}: {}",
            "✘".dimmed(),
            improvement.category(),
            improvement.description(),
            reason.dimmed()
        ),
        LoopEvent::ImprovementFailed { improvement, reason, severity } => format!(
            "{} failed     [{}] {} ({}): {}",
            "✘".red(),
            improvement.category(),
            improvement.description(),
            severity_label(*severity),
            reason
        ),
        LoopEvent::LoopError { error, .. } => format!("{} iteration error: {}", "✘".red().bold(), error),
    }
}

/// Multi-line summary of `report`.
pub fn format_report(report: &ImprovementReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", "Improvement report".bold().underline()));
    out.push_str(&format!(
        "  total {}  deployed {}  rolled back {}  failed {}\n",
        report.total_count,
        report.deployed_count.to_string().green(),
        report.rolled_back_count.to_string().yellow(),
        report.failed_count.to_string().red()
    ));
    out.push_str(&format!(
        "  success rate {:.1}%  average gain {:.2}%  overall improvement {:.2}%\n",
        report.success_rate * 100.0,
        report.average_gain * 100.0,
        report.overall_improvement * 100.0
    ));
    for (category, stats) in &report.by_category {
        out.push_str(&format!(
            "  {:<20} {:>3} total {:>3} deployed {:>3} rolled back\n",
            category, stats.total, stats.deployed, stats.rolled_back
        ));
    }
    for rec in &report.recommendations {
        out.push_str(&format!("  → {}\n", rec.cyan()));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
