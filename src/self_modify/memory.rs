//! # Stage: Improvement History & Reporting
//!
//! ## Responsibility
//! Keeps the record of every improvement that reached an outcome, answers
//! filtered history queries, and derives the aggregate [`ImprovementReport`].
//!
//! Records are upserted by id: a deployed improvement that is later rolled
//! back manually replaces its earlier record rather than appearing twice.
//!
//! An optional [`HistorySink`] mirrors every write to durable storage
//! (see `sqlite_log` behind the `sqlite-log` feature). Mirroring is
//! best-effort: a sink failure is logged and the in-memory write still
//! succeeds.
//!
//! ## Guarantees
//! - Newest-first: [`ImprovementHistory::query`] orders by `created_at_ms`
//!   descending, later insertions first on ties.
//! - Non-panicking: every aggregate handles the empty history.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::improvement::{Category, Improvement, StatusKind};

/// Size of the recent window the trend compares against the whole history.
pub const TREND_WINDOW: usize = 10;

/// Band around the overall success rate inside which the trend is stable.
pub const TREND_BAND: f64 = 0.1;

// ---------------------------------------------------------------------------
// HistoryFilter
// ---------------------------------------------------------------------------

/// Conjunctive filter for [`ImprovementHistory::query`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub category: Option<Category>,
    pub status: Option<StatusKind>,
    /// Inclusive `(from_ms, to_ms)` window on `created_at_ms`.
    pub date_range: Option<(u64, u64)>,
    pub min_gain: Option<f64>,
}

impl HistoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn status(mut self, status: StatusKind) -> Self {
        self.status = Some(status);
        self
    }

    pub fn between(mut self, from_ms: u64, to_ms: u64) -> Self {
        self.date_range = Some((from_ms, to_ms));
        self
    }

    pub fn min_gain(mut self, gain: f64) -> Self {
        self.min_gain = Some(gain);
        self
    }

    pub fn matches(&self, imp: &Improvement) -> bool {
        self.category.as_ref().map_or(true, |c| imp.category() == c)
            && self.status.map_or(true, |s| imp.status().kind() == s)
            && self
                .date_range
                .map_or(true, |(from, to)| (from..=to).contains(&imp.created_at_ms()))
            && self.min_gain.map_or(true, |g| imp.expected_gain() >= g)
    }
}

// ---------------------------------------------------------------------------
// HistorySink
// ---------------------------------------------------------------------------

/// Durable mirror of the history.
pub trait HistorySink: Send + Sync {
    fn persist(&self, improvement: &Improvement) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Per-category slice of the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total: usize,
    pub deployed: usize,
    pub rolled_back: usize,
    /// Mean `expected_gain` of the deployed improvements in this category.
    pub average_gain: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrendDirection::Improving => write!(f, "improving"),
            TrendDirection::Declining => write!(f, "declining"),
            TrendDirection::Stable => write!(f, "stable"),
        }
    }
}

/// Success rate of the most recent window against the whole history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub window: usize,
    pub recent_success_rate: f64,
    pub overall_success_rate: f64,
    pub direction: TrendDirection,
}

/// Aggregate view over the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementReport {
    pub total_count: usize,
    pub deployed_count: usize,
    pub rolled_back_count: usize,
    pub failed_count: usize,
    /// `deployed / total`, 0 when empty.
    pub success_rate: f64,
    /// Mean `expected_gain` of deployed improvements.
    pub average_gain: f64,
    /// Sum of the measured `overall_improvement` of deployed improvements.
    pub overall_improvement: f64,
    pub by_category: BTreeMap<String, CategoryStats>,
    pub trends: TrendSummary,
    pub recommendations: Vec<String>,
}

fn success_rate<'a>(items: impl Iterator<Item = &'a Improvement>) -> f64 {
    let (total, deployed) = items.fold((0usize, 0usize), |(t, d), imp| {
        (t + 1, d + usize::from(imp.status().kind() == StatusKind::Deployed))
    });
    if total == 0 { 0.0 } else { deployed as f64 / total as f64 }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() { 0.0 } else { values.iter().sum::<f64>() / values.len() as f64 }
}

// ---------------------------------------------------------------------------
// ImprovementHistory
// ---------------------------------------------------------------------------

/// In-memory history store with an optional durable mirror.
#[derive(Default)]
pub struct ImprovementHistory {
    records: Vec<Improvement>,
    index: HashMap<String, usize>,
    sink: Option<Box<dyn HistorySink>>,
}

impl std::fmt::Debug for ImprovementHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImprovementHistory")
            .field("records", &self.records.len())
            .field("mirrored", &self.sink.is_some())
            .finish()
    }
}

impl ImprovementHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every subsequent write into `sink`.
    pub fn with_sink(mut self, sink: Box<dyn HistorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Rehydrate from previously persisted records, without re-mirroring them.
    pub fn from_records(records: impl IntoIterator<Item = Improvement>) -> Self {
        let mut history = Self::new();
        for imp in records {
            history.upsert(imp);
        }
        history
    }

    fn upsert(&mut self, improvement: Improvement) {
        match self.index.get(improvement.id()) {
            Some(&pos) => self.records[pos] = improvement,
            None => {
                self.index.insert(improvement.id().to_string(), self.records.len());
                self.records.push(improvement);
            }
        }
    }

    /// Insert or replace the record for `improvement.id()`.
    pub fn record(&mut self, improvement: Improvement) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&improvement) {
                tracing::warn!(
                    target: "self_modify::memory",
                    id = %improvement.id(),
                    error = %e,
                    "history mirror write failed"
                );
            }
        }
        tracing::debug!(
            target: "self_modify::memory",
            id = %improvement.id(),
            status = %improvement.status(),
            "recorded"
        );
        self.upsert(improvement);
    }

    pub fn get(&self, id: &str) -> Option<&Improvement> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn newest_first(&self) -> Vec<&Improvement> {
        let mut all: Vec<(usize, &Improvement)> = self.records.iter().enumerate().collect();
        all.sort_by(|(ia, a), (ib, b)| b.created_at_ms().cmp(&a.created_at_ms()).then(ib.cmp(ia)));
        all.into_iter().map(|(_, imp)| imp).collect()
    }

    /// Records matching `filter`, newest first.
    pub fn query(&self, filter: &HistoryFilter) -> Vec<Improvement> {
        self.newest_first()
            .into_iter()
            .filter(|imp| filter.matches(imp))
            .cloned()
            .collect()
    }

    pub fn report(&self) -> ImprovementReport {
        let count = |kind: StatusKind| self.records.iter().filter(|i| i.status().kind() == kind).count();
        let deployed: Vec<&Improvement> = self
            .records
            .iter()
            .filter(|i| i.status().kind() == StatusKind::Deployed)
            .collect();

        let average_gain = mean(&deployed.iter().map(|i| i.expected_gain()).collect::<Vec<_>>());
        let overall_improvement: f64 = deployed
            .iter()
            .filter_map(|i| i.test_results())
            .map(|r| r.performance.overall_improvement)
            .sum();

        let mut by_category: BTreeMap<String, CategoryStats> = BTreeMap::new();
        let mut gains: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for imp in &self.records {
            let key = imp.category().to_string();
            let stats = by_category.entry(key.clone()).or_default();
            stats.total += 1;
            match imp.status().kind() {
                StatusKind::Deployed => {
                    stats.deployed += 1;
                    gains.entry(key).or_default().push(imp.expected_gain());
                }
                StatusKind::RolledBack => stats.rolled_back += 1,
                _ => {}
            }
        }
        for (key, g) in &gains {
            if let Some(stats) = by_category.get_mut(key) {
                stats.average_gain = mean(g);
            }
        }

        let newest = self.newest_first();
        let overall_success_rate = success_rate(self.records.iter());
        let recent_success_rate = success_rate(newest.iter().take(TREND_WINDOW).copied());
        let direction = if self.records.is_empty() {
            TrendDirection::Stable
        } else if recent_success_rate > overall_success_rate + TREND_BAND {
            TrendDirection::Improving
        } else if recent_success_rate < overall_success_rate - TREND_BAND {
            TrendDirection::Declining
        } else {
            TrendDirection::Stable
        };
        let trends = TrendSummary {
            window: TREND_WINDOW,
            recent_success_rate,
            overall_success_rate,
            direction,
        };

        let recommendations = recommend(self.records.len(), overall_success_rate, &by_category, &trends);

        ImprovementReport {
            total_count: self.records.len(),
            deployed_count: deployed.len(),
            rolled_back_count: count(StatusKind::RolledBack),
            failed_count: count(StatusKind::Failed),
            success_rate: overall_success_rate,
            average_gain,
            overall_improvement,
            by_category,
            trends,
            recommendations,
        }
    }
}

fn recommend(
    total: usize,
    success_rate: f64,
    by_category: &BTreeMap<String, CategoryStats>,
    trends: &TrendSummary,
) -> Vec<String> {
    let mut out = Vec::new();
    if total == 0 {
        out.push("No improvements recorded yet; let the loop complete an iteration.".to_string());
        return out;
    }
    if total >= 5 && success_rate < 0.3 {
        out.push(format!(
            "Success rate is {:.0}%; raise the discovery confidence threshold to filter weak candidates.",
            success_rate * 100.0
        ));
    }
    for (category, stats) in by_category {
        if stats.total >= 2 && stats.rolled_back * 2 > stats.total {
            out.push(format!(
                "Category '{}' rolled back {} of {} improvements; review its quality gates or candidate source.",
                category, stats.rolled_back, stats.total
            ));
        }
    }
    if trends.direction == TrendDirection::Declining {
        out.push(format!(
            "Recent success rate {:.0}% trails the overall {:.0}%; inspect the latest rollbacks.",
            trends.recent_success_rate * 100.0,
            trends.overall_success_rate * 100.0
        ));
    }
    if out.is_empty() {
        out.push("Pipeline healthy; no action needed.".to_string());
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoopError;
    use crate::improvement::{
        PerformanceResults, ResourceResults, StabilityResults, Status, TestResults,
    };
    use crate::metrics::{BaselineComparison, PerformanceMetrics};
    use std::sync::{Arc, Mutex};

    fn results(overall: f64) -> TestResults {
        TestResults {
            performance: PerformanceResults { metrics: PerformanceMetrics::default(), overall_improvement: overall },
            stability: StabilityResults { reliability: 0.99 },
            resources: ResourceResults { efficiency: 1.0 },
            comparison: BaselineComparison::default(),
            duration_ms: 1,
        }
    }

    fn settled(id: &str, category: Category, gain: f64, ts: u64, outcome: Status) -> Improvement {
        let mut imp = Improvement::new(category, id, 0.9, gain, 0.1).with_id(id).with_created_at_ms(ts);
        imp.transition(Status::Testing).unwrap();
        if outcome == Status::Failed {
            imp.settle(Status::Failed, "rejected").unwrap();
            return imp;
        }
        imp.attach_results(results(gain)).unwrap();
        imp.transition(Status::Phase { index: 0, name: "canary".into() }).unwrap();
        imp.settle(outcome, "done").unwrap();
        imp
    }

    fn deployed(id: &str, category: Category, gain: f64, ts: u64) -> Improvement {
        settled(id, category, gain, ts, Status::Deployed)
    }

    // -----------------------------------------------------------------------
    // Storage & query
    // -----------------------------------------------------------------------

    #[test]
    fn query_is_newest_first() {
        let mut h = ImprovementHistory::new();
        h.record(deployed("old", Category::Ensemble, 0.1, 100));
        h.record(deployed("new", Category::Ensemble, 0.1, 300));
        h.record(deployed("mid", Category::Ensemble, 0.1, 200));
        let ids: Vec<String> = h.query(&HistoryFilter::new()).iter().map(|i| i.id().to_string()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn record_upserts_by_id() {
        let mut h = ImprovementHistory::new();
        let mut imp = deployed("a", Category::Architecture, 0.1, 1);
        h.record(imp.clone());
        imp.settle(Status::RolledBack, "manual").unwrap();
        h.record(imp);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("a").unwrap().status(), &Status::RolledBack);
    }

    #[test]
    fn filters_combine_conjunctively() {
        let mut h = ImprovementHistory::new();
        h.record(deployed("a", Category::Architecture, 0.10, 100));
        h.record(deployed("b", Category::Architecture, 0.01, 200));
        h.record(settled("c", Category::Architecture, 0.20, 300, Status::RolledBack));
        h.record(deployed("d", Category::Ensemble, 0.30, 400));

        let f = HistoryFilter::new()
            .category(Category::Architecture)
            .status(StatusKind::Deployed)
            .min_gain(0.05);
        let ids: Vec<String> = h.query(&f).iter().map(|i| i.id().to_string()).collect();
        assert_eq!(ids, vec!["a"]);

        let ranged = h.query(&HistoryFilter::new().between(200, 300));
        assert_eq!(ranged.len(), 2);
    }

    #[test]
    fn from_records_rehydrates() {
        let h = ImprovementHistory::from_records(vec![
            deployed("a", Category::Ensemble, 0.1, 1),
            deployed("a", Category::Ensemble, 0.2, 1),
        ]);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("a").unwrap().expected_gain(), 0.2);
    }

    // -----------------------------------------------------------------------
    // Sink
    // -----------------------------------------------------------------------

    struct CountingSink {
        ids: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl HistorySink for CountingSink {
        fn persist(&self, imp: &Improvement) -> Result<()> {
            if self.fail {
                return Err(LoopError::History("disk full".into()));
            }
            self.ids.lock().unwrap().push(imp.id().to_string());
            Ok(())
        }
    }

    #[test]
    fn sink_sees_every_write() {
        let ids = Arc::new(Mutex::new(Vec::new()));
        let mut h = ImprovementHistory::new().with_sink(Box::new(CountingSink { ids: ids.clone(), fail: false }));
        h.record(deployed("a", Category::Ensemble, 0.1, 1));
        h.record(deployed("b", Category::Ensemble, 0.1, 2));
        assert_eq!(*ids.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn sink_failure_does_not_lose_record() {
        let ids = Arc::new(Mutex::new(Vec::new()));
        let mut h = ImprovementHistory::new().with_sink(Box::new(CountingSink { ids, fail: true }));
        h.record(deployed("a", Category::Ensemble, 0.1, 1));
        assert_eq!(h.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Report
    // -----------------------------------------------------------------------

    #[test]
    fn empty_report() {
        let r = ImprovementHistory::new().report();
        assert_eq!(r.total_count, 0);
        assert_eq!(r.success_rate, 0.0);
        assert_eq!(r.average_gain, 0.0);
        assert_eq!(r.trends.direction, TrendDirection::Stable);
        assert_eq!(r.recommendations.len(), 1);
        assert!(r.recommendations[0].contains("No improvements"));
    }

    #[test]
    fn report_aggregates() {
        let mut h = ImprovementHistory::new();
        h.record(deployed("a", Category::Ensemble, 0.10, 1));
        h.record(deployed("b", Category::Ensemble, 0.20, 2));
        h.record(settled("c", Category::Activation, 0.05, 3, Status::RolledBack));
        h.record(settled("d", Category::Activation, 0.05, 4, Status::Failed));

        let r = h.report();
        assert_eq!(r.total_count, 4);
        assert_eq!(r.deployed_count, 2);
        assert_eq!(r.rolled_back_count, 1);
        assert_eq!(r.failed_count, 1);
        assert!((r.success_rate - 0.5).abs() < 1e-12);
        assert!((r.average_gain - 0.15).abs() < 1e-12);
        assert!((r.overall_improvement - 0.30).abs() < 1e-12);

        let ensemble = &r.by_category["ensemble"];
        assert_eq!((ensemble.total, ensemble.deployed, ensemble.rolled_back), (2, 2, 0));
        assert!((ensemble.average_gain - 0.15).abs() < 1e-12);
        let activation = &r.by_category["activation"];
        assert_eq!((activation.total, activation.deployed, activation.rolled_back), (2, 0, 1));
        assert_eq!(activation.average_gain, 0.0);
    }

    #[test]
    fn declining_trend_is_flagged() {
        let mut h = ImprovementHistory::new();
        for i in 0..10 {
            h.record(deployed(&format!("good{i}"), Category::Ensemble, 0.1, i));
        }
        for i in 10..20 {
            h.record(settled(&format!("bad{i}"), Category::Regularization, 0.1, i, Status::RolledBack));
        }
        let r = h.report();
        assert_eq!(r.trends.recent_success_rate, 0.0);
        assert!((r.trends.overall_success_rate - 0.5).abs() < 1e-12);
        assert_eq!(r.trends.direction, TrendDirection::Declining);
        assert!(r.recommendations.iter().any(|s| s.contains("trails the overall")));
        assert!(r.recommendations.iter().any(|s| s.contains("'regularization'")));
    }

    #[test]
    fn improving_trend() {
        let mut h = ImprovementHistory::new();
        for i in 0..10 {
            h.record(settled(&format!("bad{i}"), Category::Ensemble, 0.1, i, Status::Failed));
        }
        for i in 10..20 {
            h.record(deployed(&format!("good{i}"), Category::Ensemble, 0.1, i));
        }
        assert_eq!(h.report().trends.direction, TrendDirection::Improving);
    }

    #[test]
    fn healthy_history_recommends_nothing_to_do() {
        let mut h = ImprovementHistory::new();
        h.record(deployed("a", Category::Ensemble, 0.1, 1));
        let r = h.report();
        assert_eq!(r.recommendations, vec!["Pipeline healthy; no action needed.".to_string()]);
    }

    #[test]
    fn report_serializes() {
        let json = serde_json::to_value(ImprovementHistory::new().report()).unwrap();
        assert_eq!(json["trends"]["direction"], "stable");
    }
}
