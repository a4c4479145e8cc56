// =============================================================================
// Cardinality Guard — series-growth watchdog over the registry
// =============================================================================
//
// Periodically walks the registry, compares per-group live series counts to
// a baseline snapshot, and reports growth through gauges. Growth over the
// configured percent threshold marks the group an offender; this is
// alertable, never fatal, unless strict exceptions are on.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::MetricsConfig;

use super::registry::{MetricsHandles, MetricsRegistry};

pub struct CardinalityGuard {
    registry: Arc<MetricsRegistry>,
    metrics: MetricsHandles,
    growth_percent_threshold: f64,
    strict: bool,
    baseline: Mutex<Option<HashMap<String, usize>>>,
}

/// Result of one guard sweep.
#[derive(Debug, Clone, Default)]
pub struct GuardReport {
    pub offenders: Vec<String>,
    pub growth_percent: HashMap<String, f64>,
}

impl CardinalityGuard {
    pub fn new(
        registry: Arc<MetricsRegistry>,
        metrics: MetricsHandles,
        config: &MetricsConfig,
    ) -> Self {
        let baseline = config
            .cardinality_baseline_path
            .as_deref()
            .and_then(|path| match Self::load_baseline(path) {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!(path, error = %e, "failed to load cardinality baseline");
                    None
                }
            });

        Self {
            registry,
            metrics,
            growth_percent_threshold: config.cardinality_growth_percent,
            strict: config.strict_exceptions,
            baseline: Mutex::new(baseline),
        }
    }

    fn load_baseline(path: &str) -> Result<HashMap<String, usize>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read baseline from {path}"))?;
        serde_json::from_str(&content).context("failed to parse cardinality baseline")
    }

    /// One sweep. The first sweep with no configured baseline captures the
    /// current counts as the baseline.
    pub fn run_once(&self) -> GuardReport {
        let current: HashMap<String, usize> = self
            .registry
            .series_counts_by_group()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let mut baseline_guard = self.baseline.lock();
        let baseline = match baseline_guard.as_ref() {
            Some(b) => b.clone(),
            None => {
                info!(groups = current.len(), "cardinality baseline captured");
                *baseline_guard = Some(current.clone());
                current.clone()
            }
        };
        drop(baseline_guard);

        let mut report = GuardReport::default();
        for (group, count) in &current {
            let base = baseline.get(group).copied().unwrap_or(0);
            let growth = if base == 0 {
                if *count > 0 { 100.0 } else { 0.0 }
            } else {
                (*count as f64 - base as f64) / base as f64 * 100.0
            };

            self.metrics.guard_series.set(&[group.as_str()], *count as f64);
            self.metrics.guard_growth_percent.set(&[group.as_str()], growth);
            report.growth_percent.insert(group.clone(), growth);

            if growth > self.growth_percent_threshold {
                report.offenders.push(group.clone());
            }
        }
        report.offenders.sort();

        self.metrics
            .guard_offenders
            .set(&[], report.offenders.len() as f64);
        self.metrics
            .guard_last_run
            .set(&[], chrono::Utc::now().timestamp() as f64);

        if !report.offenders.is_empty() {
            warn!(offenders = ?report.offenders, "cardinality growth over threshold");
            if self.strict {
                // Strict mode treats sustained growth as a deploy defect.
                panic!(
                    "cardinality guard breach in strict mode: {:?}",
                    report.offenders
                );
            }
        }
        report
    }
}
