// =============================================================================
// Pipeline summaries — per-expiry totals, rolling window, trends ingestion
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::error::PhaseOutcome;

/// Totals over one expiry's phase execution, attached to
/// `state.meta["pipeline_summary"]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub phases_total: u32,
    pub phases_ok: u32,
    pub phases_error: u32,
    pub phases_with_retries: u32,
    pub retry_enabled: bool,
    /// Outcome token → count over failed phases.
    pub error_outcomes: BTreeMap<String, u32>,
    pub aborted_early: bool,
    pub fatal: bool,
    pub recoverable_exhausted: bool,
}

impl PipelineSummary {
    pub fn record(&mut self, outcome: PhaseOutcome, retried: bool) {
        self.phases_total += 1;
        if retried {
            self.phases_with_retries += 1;
        }
        if outcome.is_ok() {
            self.phases_ok += 1;
            return;
        }
        self.phases_error += 1;
        *self
            .error_outcomes
            .entry(outcome.as_str().to_string())
            .or_insert(0) += 1;
        match outcome {
            PhaseOutcome::Abort => self.aborted_early = true,
            PhaseOutcome::Fatal | PhaseOutcome::Unknown => self.fatal = true,
            PhaseOutcome::RecoverableExhausted => self.recoverable_exhausted = true,
            _ => {}
        }
    }

    /// phases_error / phases_total; 0 when no phases ran.
    pub fn error_ratio(&self) -> f64 {
        if self.phases_total == 0 {
            0.0
        } else {
            self.phases_error as f64 / self.phases_total as f64
        }
    }

    pub fn success(&self) -> bool {
        self.phases_error == 0
    }

    /// Merge another expiry's totals into a cycle-level aggregate.
    pub fn merge(&mut self, other: &PipelineSummary) {
        self.phases_total += other.phases_total;
        self.phases_ok += other.phases_ok;
        self.phases_error += other.phases_error;
        self.phases_with_retries += other.phases_with_retries;
        self.retry_enabled |= other.retry_enabled;
        for (token, count) in &other.error_outcomes {
            *self.error_outcomes.entry(token.clone()).or_insert(0) += count;
        }
        self.aborted_early |= other.aborted_early;
        self.fatal |= other.fatal;
        self.recoverable_exhausted |= other.recoverable_exhausted;
    }
}

// =============================================================================
// Rolling cycle window
// =============================================================================

/// Last-N cycle outcomes feeding the window gauges. Size 0 disables.
#[derive(Debug)]
pub struct RollingWindow {
    size: usize,
    outcomes: VecDeque<bool>,
}

impl RollingWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            outcomes: VecDeque::with_capacity(size),
        }
    }

    pub fn enabled(&self) -> bool {
        self.size > 0
    }

    pub fn push(&mut self, success: bool) {
        if self.size == 0 {
            return;
        }
        if self.outcomes.len() == self.size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    pub fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.outcomes.iter().filter(|s| **s).count() as f64 / self.outcomes.len() as f64
    }

    pub fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        1.0 - self.success_rate()
    }
}

// =============================================================================
// Trends ingestion
// =============================================================================

/// Aggregate block of the trend file (see panels). Read back each cycle to
/// feed the `g6_trends_*` gauges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrendsAggregate {
    pub cycles: u64,
    pub success_cycles: u64,
    pub success_rate: f64,
    pub errors_total: u64,
    pub phase_errors_total: u64,
    pub phases_total: u64,
}

/// Read the aggregate block from a trend file written by the panels writer.
pub fn read_trends_aggregate(path: &std::path::Path) -> Result<TrendsAggregate> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read trends from {}", path.display()))?;
    let doc: serde_json::Value =
        serde_json::from_str(&content).context("failed to parse trends file")?;
    let aggregate = doc
        .get("aggregate")
        .cloned()
        .context("trends file missing aggregate block")?;
    serde_json::from_value(aggregate).context("failed to decode trends aggregate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_totals_balance() {
        let mut s = PipelineSummary::default();
        s.record(PhaseOutcome::Ok, false);
        s.record(PhaseOutcome::Ok, true);
        s.record(PhaseOutcome::RecoverableExhausted, true);
        assert_eq!(s.phases_total, 3);
        assert_eq!(s.phases_ok + s.phases_error, s.phases_total);
        assert_eq!(s.phases_with_retries, 2);
        assert!(s.recoverable_exhausted);
        assert!(!s.aborted_early);
        assert_eq!(s.error_outcomes["recoverable_exhausted"], 1);
        assert!((s.error_ratio() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn summary_is_order_independent() {
        let outcomes = [
            PhaseOutcome::Ok,
            PhaseOutcome::Recoverable,
            PhaseOutcome::Ok,
            PhaseOutcome::Fatal,
        ];
        let mut forward = PipelineSummary::default();
        for o in outcomes {
            forward.record(o, false);
        }
        let mut backward = PipelineSummary::default();
        for o in outcomes.iter().rev() {
            backward.record(*o, false);
        }
        assert_eq!(forward.phases_total, backward.phases_total);
        assert_eq!(forward.phases_ok, backward.phases_ok);
        assert_eq!(forward.phases_error, backward.phases_error);
        assert_eq!(forward.error_outcomes, backward.error_outcomes);
    }

    #[test]
    fn empty_summary_error_ratio_is_zero() {
        assert_eq!(PipelineSummary::default().error_ratio(), 0.0);
    }

    #[test]
    fn rolling_window_caps_and_rates() {
        let mut w = RollingWindow::new(3);
        w.push(true);
        w.push(true);
        w.push(false);
        w.push(false); // evicts the first true
        assert!((w.success_rate() - 1.0 / 3.0).abs() < 1e-12);
        assert!((w.error_rate() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn zero_window_is_disabled_and_inert() {
        let mut w = RollingWindow::new(0);
        assert!(!w.enabled());
        w.push(true);
        assert_eq!(w.success_rate(), 0.0);
    }

    #[test]
    fn trends_aggregate_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trends.json");
        std::fs::write(
            &path,
            r#"{"entries": [], "aggregate": {"cycles": 10, "success_cycles": 9,
                "success_rate": 0.9, "errors_total": 2, "phase_errors_total": 2,
                "phases_total": 130}}"#,
        )
        .unwrap();
        let agg = read_trends_aggregate(&path).unwrap();
        assert_eq!(agg.cycles, 10);
        assert!((agg.success_rate - 0.9).abs() < 1e-12);
    }
}
