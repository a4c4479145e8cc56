// =============================================================================
// Shadow Gating Controller — rolling parity window with hysteresis
// =============================================================================
//
// Each shadow-vs-legacy expiry comparison becomes one ParitySample in a
// rolling window. The controller scores the window on every sample and
// produces a GatingDecision. Protected-field diffs block promotion on the
// sample that carries them; rollback triggers (hash churn, accumulated
// protected diffs) demote regardless of the ok ratio; canary and promote
// need their ratio targets plus hysteresis streaks.
// =============================================================================

use std::collections::{BTreeSet, HashSet, VecDeque};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::ShadowGatingConfig;
use crate::types::GatingMode;

use super::hash::{diff_fields, parity_hash_v2, StateDigest};
use super::score::{weighted_alert_parity, AlertSample};

/// One comparison of shadow vs legacy output for an expiry.
#[derive(Debug, Clone)]
pub struct ParitySample {
    pub parity_ok: bool,
    pub diff_fields: BTreeSet<String>,
    pub parity_hash: String,
}

impl ParitySample {
    /// Build a sample from the two sides' digests. The hash fingerprints
    /// the shadow side.
    pub fn compare(legacy: &StateDigest, shadow: &StateDigest) -> Self {
        let diffs = diff_fields(legacy, shadow);
        Self {
            parity_ok: diffs.is_empty(),
            diff_fields: diffs,
            parity_hash: parity_hash_v2(shadow),
        }
    }
}

/// The decision attached to each cycle's output while shadow mode runs.
#[derive(Debug, Clone, Serialize)]
pub struct GatingDecision {
    pub mode: GatingMode,
    pub promote: bool,
    pub canary: bool,
    pub parity_ok_ratio: f64,
    pub window_size: usize,
    pub diff_count: usize,
    pub protected_diff: bool,
    pub ok_streak: u32,
    pub fail_streak: u32,
    pub hash_distinct: usize,
    pub hash_churn_ratio: f64,
    pub protected_in_window: usize,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authoritative: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub churn_window_size: Option<usize>,
}

/// Report emitted when weighted alert parity crosses the anomaly threshold.
#[derive(Debug, Clone, Serialize)]
pub struct AlertParityAnomaly {
    pub weighted_diff: f64,
    pub union_size: usize,
    /// Categories present on exactly one side.
    pub diverging_categories: Vec<String>,
}

pub struct GatingController {
    config: ShadowGatingConfig,
    window_size: usize,
    window: VecDeque<ParitySample>,
    protected: HashSet<String>,
    ok_streak: u32,
    fail_streak: u32,
}

impl GatingController {
    pub fn new(config: ShadowGatingConfig, window_size: usize) -> Self {
        let mut protected: HashSet<String> =
            ["expiry_date", "instrument_count"].iter().map(|s| s.to_string()).collect();
        protected.extend(config.protected_fields.iter().cloned());
        Self {
            config,
            window_size: window_size.max(1),
            window: VecDeque::with_capacity(window_size.max(1)),
            protected,
            ok_streak: 0,
            fail_streak: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.mode != GatingMode::Off
    }

    /// Whether the new pipeline is active for an index under the current
    /// canary scoping. An explicit allowlist wins over the percentage.
    pub fn canary_applies_to(&self, index: &str) -> bool {
        if !self.config.canary_indices.is_empty() {
            return self.config.canary_indices.iter().any(|i| i == index);
        }
        if self.config.canary_pct >= 100.0 {
            return true;
        }
        // Deterministic percentage sample over the index name.
        let bucket = index
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
            % 100;
        (bucket as f64) < self.config.canary_pct
    }

    /// Ingest one sample and produce the decision for it.
    pub fn record(&mut self, sample: ParitySample) -> GatingDecision {
        let protected_diff = sample
            .diff_fields
            .iter()
            .any(|f| self.protected.contains(f));

        if sample.parity_ok {
            self.ok_streak += 1;
            self.fail_streak = 0;
        } else {
            self.fail_streak += 1;
            self.ok_streak = 0;
        }

        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        let window_len = self.window.len();
        let ok_count = self.window.iter().filter(|s| s.parity_ok).count();
        let ratio = ok_count as f64 / window_len as f64;
        let diff_count = self
            .window
            .iter()
            .map(|s| s.diff_fields.len())
            .sum::<usize>();
        let protected_in_window = self
            .window
            .iter()
            .filter(|s| s.diff_fields.iter().any(|f| self.protected.contains(f)))
            .count();

        // Churn over the configured churn window (0 = full window).
        let churn_span = if self.config.churn_window > 0 {
            self.config.churn_window.min(window_len)
        } else {
            window_len
        };
        let distinct: HashSet<&str> = self
            .window
            .iter()
            .rev()
            .take(churn_span)
            .map(|s| s.parity_hash.as_str())
            .collect();
        let hash_distinct = distinct.len();
        let churn_ratio = if churn_span == 0 {
            0.0
        } else {
            hash_distinct as f64 / churn_span as f64
        };

        let mut decision = GatingDecision {
            mode: self.config.mode,
            promote: false,
            canary: false,
            parity_ok_ratio: ratio,
            window_size: window_len,
            diff_count,
            protected_diff,
            ok_streak: self.ok_streak,
            fail_streak: self.fail_streak,
            hash_distinct,
            hash_churn_ratio: churn_ratio,
            protected_in_window,
            reason: String::new(),
            authoritative: self.config.authoritative.then_some(true),
            churn_window_size: (self.config.churn_window > 0).then_some(churn_span),
        };

        decision.reason = self.decide(&mut decision);
        if decision.reason.starts_with("rollback") || decision.reason == "fail_hysteresis" {
            warn!(
                reason = %decision.reason,
                ratio,
                protected_in_window,
                churn_ratio,
                "shadow gating demotion"
            );
        } else if decision.promote {
            info!(ratio, ok_streak = self.ok_streak, "shadow pipeline promotion criteria met");
        }
        decision
    }

    fn decide(&self, d: &mut GatingDecision) -> String {
        if self.config.force_demote {
            return "forced_demote".to_string();
        }
        if d.window_size < self.config.min_samples {
            return "insufficient_samples".to_string();
        }
        if d.protected_diff {
            return "protected_block".to_string();
        }
        if d.hash_churn_ratio >= self.config.churn_rollback_threshold {
            return "rollback_churn".to_string();
        }
        if d.protected_in_window >= self.config.protected_rollback_threshold {
            return "rollback_protected".to_string();
        }

        let gating_active = matches!(self.config.mode, GatingMode::Canary | GatingMode::Promote);
        if gating_active && d.fail_streak >= self.config.fail_hysteresis {
            return "fail_hysteresis".to_string();
        }

        if gating_active && d.parity_ok_ratio >= self.config.canary_target {
            d.canary = true;
        }
        if self.config.mode == GatingMode::Promote
            && d.parity_ok_ratio >= self.config.parity_target
            && d.ok_streak >= self.config.ok_hysteresis
        {
            d.promote = true;
            return "parity_target_met".to_string();
        }
        "waiting_hysteresis".to_string()
    }

    /// Weighted alert parity anomaly check for one cycle's alert
    /// populations. Returns a report only past both configured floors.
    pub fn alert_anomaly(
        &self,
        legacy: &[AlertSample],
        shadow: &[AlertSample],
        threshold: f64,
        min_total: usize,
    ) -> Option<AlertParityAnomaly> {
        let l_cats: BTreeSet<&str> = legacy.iter().map(|a| a.category.as_str()).collect();
        let p_cats: BTreeSet<&str> = shadow.iter().map(|a| a.category.as_str()).collect();
        let union_size = l_cats.union(&p_cats).count();
        if union_size < min_total {
            return None;
        }

        let weighted_diff =
            weighted_alert_parity(legacy, shadow, &self.config.alert_severity_weights);
        if weighted_diff <= threshold {
            return None;
        }

        let diverging: Vec<String> = l_cats
            .symmetric_difference(&p_cats)
            .map(|s| s.to_string())
            .collect();
        Some(AlertParityAnomaly {
            weighted_diff,
            union_size,
            diverging_categories: diverging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: GatingMode) -> ShadowGatingConfig {
        let mut cfg = ShadowGatingConfig::default();
        cfg.mode = mode;
        cfg
    }

    fn ok_sample(hash: &str) -> ParitySample {
        ParitySample {
            parity_ok: true,
            diff_fields: BTreeSet::new(),
            parity_hash: hash.to_string(),
        }
    }

    fn diff_sample(fields: &[&str], hash: &str) -> ParitySample {
        ParitySample {
            parity_ok: false,
            diff_fields: fields.iter().map(|s| s.to_string()).collect(),
            parity_hash: hash.to_string(),
        }
    }

    #[test]
    fn insufficient_samples_first() {
        let mut gate = GatingController::new(config(GatingMode::Promote), 200);
        let d = gate.record(ok_sample("h1"));
        assert_eq!(d.reason, "insufficient_samples");
        assert!(!d.promote && !d.canary);
    }

    #[test]
    fn promotion_after_hysteresis_with_stable_hashes() {
        let mut gate = GatingController::new(config(GatingMode::Promote), 200);
        let mut last = None;
        for _ in 0..200 {
            last = Some(gate.record(ok_sample("stable")));
        }
        let d = last.unwrap();
        assert_eq!(d.reason, "parity_target_met");
        assert!(d.promote && d.canary);
        assert!((d.parity_ok_ratio - 1.0).abs() < 1e-12);
        assert_eq!(d.window_size, 200);
        assert!(d.ok_streak >= 10);
        assert!(!d.protected_diff);
    }

    #[test]
    fn protected_diff_blocks_promotion_immediately() {
        let mut gate = GatingController::new(config(GatingMode::Promote), 200);
        for _ in 0..200 {
            gate.record(ok_sample("stable"));
        }
        let d = gate.record(diff_sample(&["instrument_count"], "stable"));
        assert_eq!(d.reason, "protected_block");
        assert!(!d.promote);
        assert!(d.protected_diff);
    }

    #[test]
    fn churn_rollback_fires_on_distinct_hashes() {
        let mut cfg = config(GatingMode::Canary);
        cfg.min_samples = 10;
        cfg.churn_rollback_threshold = 0.5;
        let mut gate = GatingController::new(cfg, 50);
        let mut last = None;
        for i in 0..50 {
            last = Some(gate.record(ok_sample(&format!("h{i}"))));
        }
        assert_eq!(last.unwrap().reason, "rollback_churn");
    }

    #[test]
    fn accumulated_protected_diffs_roll_back() {
        let mut cfg = config(GatingMode::Canary);
        cfg.min_samples = 5;
        cfg.protected_rollback_threshold = 3;
        let mut gate = GatingController::new(cfg, 50);
        for _ in 0..10 {
            gate.record(ok_sample("stable"));
        }
        gate.record(diff_sample(&["expiry_date"], "stable"));
        gate.record(diff_sample(&["expiry_date"], "stable"));
        gate.record(diff_sample(&["expiry_date"], "stable"));
        // A clean sample afterwards: window still carries three protected
        // diffs, so the rollback persists.
        let d = gate.record(ok_sample("stable"));
        assert_eq!(d.reason, "rollback_protected");
        assert_eq!(d.protected_in_window, 3);
    }

    #[test]
    fn fail_hysteresis_downgrades_canary() {
        let mut cfg = config(GatingMode::Canary);
        cfg.min_samples = 5;
        cfg.fail_hysteresis = 5;
        // Keep churn quiet for this test.
        cfg.churn_rollback_threshold = 2.0;
        let mut gate = GatingController::new(cfg, 100);
        for _ in 0..60 {
            gate.record(ok_sample("stable"));
        }
        let mut last = None;
        for _ in 0..5 {
            last = Some(gate.record(diff_sample(&["strike_count"], "stable2")));
        }
        let d = last.unwrap();
        assert_eq!(d.reason, "fail_hysteresis");
        assert!(!d.canary);
    }

    #[test]
    fn dryrun_scores_but_never_activates() {
        let mut cfg = config(GatingMode::Dryrun);
        cfg.min_samples = 5;
        let mut gate = GatingController::new(cfg, 50);
        let mut last = None;
        for _ in 0..50 {
            last = Some(gate.record(ok_sample("stable")));
        }
        let d = last.unwrap();
        assert!(!d.canary && !d.promote);
        assert_eq!(d.reason, "waiting_hysteresis");
    }

    #[test]
    fn force_demote_overrides_everything() {
        let mut cfg = config(GatingMode::Promote);
        cfg.force_demote = true;
        let mut gate = GatingController::new(cfg, 50);
        for _ in 0..50 {
            let d = gate.record(ok_sample("stable"));
            assert_eq!(d.reason, "forced_demote");
            assert!(!d.promote);
        }
    }

    #[test]
    fn canary_allowlist_wins_over_pct() {
        let mut cfg = config(GatingMode::Canary);
        cfg.canary_indices = vec!["NIFTY".to_string()];
        cfg.canary_pct = 0.0;
        let gate = GatingController::new(cfg, 50);
        assert!(gate.canary_applies_to("NIFTY"));
        assert!(!gate.canary_applies_to("BANKNIFTY"));
    }

    #[test]
    fn anomaly_requires_both_floors() {
        let gate = GatingController::new(config(GatingMode::Dryrun), 50);
        let legacy: Vec<AlertSample> = (0..5)
            .map(|i| AlertSample {
                category: format!("l{i}"),
                severity: "warn".to_string(),
            })
            .collect();
        let shadow: Vec<AlertSample> = (0..5)
            .map(|i| AlertSample {
                category: format!("s{i}"),
                severity: "warn".to_string(),
            })
            .collect();

        // Disjoint populations over the min-total floor trip the anomaly.
        let report = gate.alert_anomaly(&legacy, &shadow, 0.3, 5).unwrap();
        assert!(report.weighted_diff > 0.99);
        assert_eq!(report.union_size, 10);
        assert_eq!(report.diverging_categories.len(), 10);

        // Under the union floor: no report regardless of difference.
        assert!(gate.alert_anomaly(&legacy[..1], &shadow[..1], 0.3, 5).is_none());
    }
}
