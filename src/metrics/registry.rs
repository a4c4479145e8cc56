// =============================================================================
// Metrics Registry — group-gated registration and Prometheus exposition
// =============================================================================
//
// Registration walks the catalogue once at startup. Each metric becomes a
// `MetricCore` holding its label series as atomic cells; hot paths increment
// through cloned handles with no string lookup and no lock beyond the series
// map read. Duplicate registration returns the existing core and counts the
// attempt. Gated-off metrics still hand out handles, but the handles are
// inert and the metric never renders.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::MetricsConfig;

use super::catalogue::{self, MetricGroup, MetricKind, MetricSpec};
use super::AtomicF64;

// =============================================================================
// Series storage
// =============================================================================

struct SeriesCell {
    /// Counter or gauge value. Histograms leave this at 0.
    value: AtomicF64,
    /// Per-bucket cumulative-at-render counts; empty for non-histograms.
    buckets: Vec<AtomicU64>,
    sum: AtomicF64,
    count: AtomicU64,
}

impl SeriesCell {
    fn new(bucket_count: usize) -> Self {
        Self {
            value: AtomicF64::new(0.0),
            buckets: (0..bucket_count).map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicF64::new(0.0),
            count: AtomicU64::new(0),
        }
    }
}

/// One registered metric with all its label series.
pub struct MetricCore {
    spec: MetricSpec,
    enabled: bool,
    series: RwLock<HashMap<Vec<String>, Arc<SeriesCell>>>,
}

impl MetricCore {
    fn new(spec: MetricSpec, enabled: bool) -> Self {
        Self {
            spec,
            enabled,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn group(&self) -> MetricGroup {
        self.spec.group
    }

    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    fn cell(&self, labels: &[&str]) -> Option<Arc<SeriesCell>> {
        if !self.enabled {
            return None;
        }
        if labels.len() != self.spec.labels.len() {
            debug_assert!(
                false,
                "label arity mismatch for {}: got {}, want {}",
                self.spec.name,
                labels.len(),
                self.spec.labels.len()
            );
            return None;
        }

        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        if let Some(cell) = self.series.read().get(&key) {
            return Some(cell.clone());
        }

        let mut series = self.series.write();
        if series.len() >= self.spec.cardinality_budget && !series.contains_key(&key) {
            // Over budget is alertable, not fatal; the guard reports it.
            debug!(metric = self.spec.name, budget = self.spec.cardinality_budget,
                   "metric over cardinality budget");
        }
        let bucket_count = self.spec.buckets.map(|b| b.len()).unwrap_or(0);
        Some(
            series
                .entry(key)
                .or_insert_with(|| Arc::new(SeriesCell::new(bucket_count)))
                .clone(),
        )
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Counter handle. Cloning is cheap; increments are lock-light.
#[derive(Clone)]
pub struct Counter(Arc<MetricCore>);

impl Counter {
    pub fn inc(&self, labels: &[&str]) {
        self.inc_by(labels, 1.0);
    }

    pub fn inc_by(&self, labels: &[&str], amount: f64) {
        if amount < 0.0 {
            return;
        }
        if let Some(cell) = self.0.cell(labels) {
            cell.value.add(amount);
        }
    }

    pub fn get(&self, labels: &[&str]) -> f64 {
        self.0.cell(labels).map(|c| c.value.get()).unwrap_or(0.0)
    }

    pub(crate) fn core(&self) -> &Arc<MetricCore> {
        &self.0
    }
}

#[derive(Clone)]
pub struct Gauge(Arc<MetricCore>);

impl Gauge {
    pub fn set(&self, labels: &[&str], value: f64) {
        if let Some(cell) = self.0.cell(labels) {
            cell.value.set(value);
        }
    }

    pub fn add(&self, labels: &[&str], delta: f64) {
        if let Some(cell) = self.0.cell(labels) {
            cell.value.add(delta);
        }
    }

    pub fn get(&self, labels: &[&str]) -> f64 {
        self.0.cell(labels).map(|c| c.value.get()).unwrap_or(0.0)
    }
}

#[derive(Clone)]
pub struct Histogram(Arc<MetricCore>);

impl Histogram {
    pub fn observe(&self, labels: &[&str], value: f64) {
        let Some(cell) = self.0.cell(labels) else { return };
        let Some(bounds) = self.0.spec.buckets else { return };
        for (i, bound) in bounds.iter().enumerate() {
            if value <= *bound {
                cell.buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        cell.sum.add(value);
        cell.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, labels: &[&str]) -> u64 {
        self.0
            .cell(labels)
            .map(|c| c.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn sum(&self, labels: &[&str]) -> f64 {
        self.0.cell(labels).map(|c| c.sum.get()).unwrap_or(0.0)
    }
}

// =============================================================================
// Registry
// =============================================================================

pub struct MetricsRegistry {
    config: MetricsConfig,
    metrics: RwLock<BTreeMap<&'static str, Arc<MetricCore>>>,
    /// Handle to g6_metric_duplicates_total once it is registered.
    duplicates: RwLock<Option<Counter>>,
}

impl MetricsRegistry {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            metrics: RwLock::new(BTreeMap::new()),
            duplicates: RwLock::new(None),
        }
    }

    /// Whitelist → blacklist → always-on bypass. The per-metric predicate is
    /// applied separately in `register`.
    fn group_enabled(&self, group: MetricGroup) -> bool {
        if group.always_on() {
            return true;
        }
        let name = group.as_str();
        if !self.config.enable_groups.is_empty()
            && !self.config.enable_groups.iter().any(|g| g == name)
        {
            return false;
        }
        !self.config.disable_groups.iter().any(|g| g == name)
    }

    /// Register one spec, returning its core. Duplicate names return the
    /// existing core and count the attempt (or error under
    /// `fail_on_duplicate`).
    pub fn register(&self, spec: MetricSpec) -> Result<Arc<MetricCore>> {
        if let Some(existing) = self.metrics.read().get(spec.name) {
            if self.config.fail_on_duplicate {
                bail!("duplicate metric registration: {}", spec.name);
            }
            if let Some(dups) = self.duplicates.read().as_ref() {
                dups.inc(&[spec.name]);
            }
            warn!(metric = spec.name, "duplicate metric registration");
            return Ok(existing.clone());
        }

        let enabled =
            self.group_enabled(spec.group) && spec.predicate.map(|p| p()).unwrap_or(true);
        let core = Arc::new(MetricCore::new(spec, enabled));

        // Warm unlabeled metrics so dashboards never see an absent series on
        // cold start. Labeled metrics render their HELP/TYPE header instead.
        if enabled && core.spec.labels.is_empty() {
            match core.spec.kind {
                MetricKind::Counter => {
                    if let Some(cell) = core.cell(&[]) {
                        cell.value.add(0.0);
                    }
                }
                MetricKind::Gauge => {
                    if let Some(cell) = core.cell(&[]) {
                        cell.value.set(0.0);
                    }
                }
                MetricKind::Histogram => {
                    Histogram(core.clone()).observe(&[], 0.0);
                }
            }
        }

        self.metrics.write().insert(core.spec.name, core.clone());
        Ok(core)
    }

    fn counter(&self, spec: MetricSpec) -> Result<Counter> {
        Ok(Counter(self.register(spec)?))
    }

    fn gauge(&self, spec: MetricSpec) -> Result<Gauge> {
        Ok(Gauge(self.register(spec)?))
    }

    fn histogram(&self, spec: MetricSpec) -> Result<Histogram> {
        Ok(Histogram(self.register(spec)?))
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.read().len()
    }

    /// Live series counts per group, for the cardinality guard.
    pub fn series_counts_by_group(&self) -> HashMap<&'static str, usize> {
        let mut out = HashMap::new();
        for core in self.metrics.read().values() {
            *out.entry(core.spec.group.as_str()).or_insert(0) += core.series_count();
        }
        out
    }

    // -------------------------------------------------------------------------
    // Exposition
    // -------------------------------------------------------------------------

    /// Render the Prometheus text format. Metrics iterate in name order and
    /// series in label order, so output is deterministic.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(16 * 1024);

        for core in self.metrics.read().values() {
            if !core.enabled {
                continue;
            }
            let spec = &core.spec;
            out.push_str(&format!("# HELP {} {}\n", spec.name, spec.help));
            out.push_str(&format!("# TYPE {} {}\n", spec.name, spec.kind.as_str()));

            let series = core.series.read();
            let mut keys: Vec<&Vec<String>> = series.keys().collect();
            keys.sort();

            for key in keys {
                let cell = &series[key];
                match spec.kind {
                    MetricKind::Counter | MetricKind::Gauge => {
                        out.push_str(&format!(
                            "{}{} {}\n",
                            spec.name,
                            format_labels(spec.labels, key, None),
                            cell.value.get()
                        ));
                    }
                    MetricKind::Histogram => {
                        let bounds = spec.buckets.unwrap_or(&[]);
                        let mut cumulative = 0u64;
                        for (i, bound) in bounds.iter().enumerate() {
                            cumulative += cell.buckets[i].load(Ordering::Relaxed);
                            out.push_str(&format!(
                                "{}_bucket{} {}\n",
                                spec.name,
                                format_labels(spec.labels, key, Some(&bound.to_string())),
                                cumulative
                            ));
                        }
                        out.push_str(&format!(
                            "{}_bucket{} {}\n",
                            spec.name,
                            format_labels(spec.labels, key, Some("+Inf")),
                            cell.count.load(Ordering::Relaxed)
                        ));
                        out.push_str(&format!(
                            "{}_sum{} {}\n",
                            spec.name,
                            format_labels(spec.labels, key, None),
                            cell.sum.get()
                        ));
                        out.push_str(&format!(
                            "{}_count{} {}\n",
                            spec.name,
                            format_labels(spec.labels, key, None),
                            cell.count.load(Ordering::Relaxed)
                        ));
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

fn format_labels(names: &[&str], values: &[String], le: Option<&str>) -> String {
    let mut parts: Vec<String> = names
        .iter()
        .zip(values.iter())
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{le}\""));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

// =============================================================================
// Handle bundle
// =============================================================================

/// Every handle the engine uses, built from the catalogue at startup and
/// passed by reference into subsystems. No string lookup per increment.
#[derive(Clone)]
pub struct MetricsHandles {
    // pipeline / phases
    pub phase_attempts: Counter,
    pub phase_retries: Counter,
    pub phase_outcomes: Counter,
    pub phase_runs: Counter,
    pub phase_duration_ms: Counter,
    pub phase_duration_seconds: Histogram,
    pub phase_retry_backoff_seconds: Histogram,
    pub phase_last_attempts: Gauge,
    // cycles
    pub cycle_success: Gauge,
    pub cycle_error_ratio: Gauge,
    pub cycles_total: Counter,
    pub cycles_success_total: Counter,
    pub cycle_success_rate_window: Gauge,
    pub cycle_error_rate_window: Gauge,
    pub trends_success_rate: Gauge,
    pub trends_cycles: Gauge,
    pub index_success: Counter,
    pub index_failures: Counter,
    pub index_fatal: Counter,
    // sla
    pub cycle_duration_seconds: Histogram,
    pub cycles_skipped: Counter,
    pub cycle_timeout: Counter,
    pub heartbeat_timestamp: Gauge,
    pub uptime_seconds: Gauge,
    // provider
    pub provider_cache_hits: Counter,
    pub provider_cache_misses: Counter,
    pub provider_cache_size: Gauge,
    pub provider_cache_hit_ratio: Gauge,
    pub provider_health: Gauge,
    pub provider_auth_failures: Counter,
    pub provider_fallbacks: Counter,
    // iv / greeks
    pub iv_success: Counter,
    pub iv_failure: Counter,
    pub iv_avg_iterations: Gauge,
    pub greeks_computed: Counter,
    pub greeks_math_failures: Counter,
    // remediation
    pub expiry_salvage: Counter,
    pub expiry_fabricated: Counter,
    // panels
    pub panel_writes: Counter,
    pub panel_integrity_mismatches: Counter,
    pub panel_integrity_ok: Gauge,
    // shadow parity
    pub shadow_parity_ok_ratio: Gauge,
    pub shadow_parity_score: Gauge,
    pub shadow_parity_window_size: Gauge,
    pub shadow_decisions: Counter,
    pub shadow_protected_diffs: Counter,
    pub shadow_hash_churn_ratio: Gauge,
    // batcher
    pub batch_queue_depth: Gauge,
    pub batch_flush_duration: Histogram,
    pub batch_flush_increments: Gauge,
    pub batch_adaptive_target: Gauge,
    pub batch_shed: Counter,
    // guard + lifecycle
    pub guard_offenders: Gauge,
    pub guard_growth_percent: Gauge,
    pub guard_series: Gauge,
    pub guard_last_run: Gauge,
    pub lifecycle_deleted: Counter,
    pub lifecycle_compression_candidates: Gauge,
}

impl MetricsHandles {
    /// Register the whole catalogue against `registry` and wire provenance
    /// gauges. Call once at startup.
    pub fn build(registry: &MetricsRegistry) -> Result<Self> {
        let mut by_name: HashMap<&'static str, MetricSpec> = HashMap::new();
        for spec in catalogue::catalogue() {
            by_name.insert(spec.name, spec);
        }
        let mut take = |name: &str| -> Result<MetricSpec> {
            by_name
                .remove(name)
                .ok_or_else(|| anyhow::anyhow!("metric '{name}' missing from catalogue"))
        };

        let duplicates = registry.counter(take("g6_metric_duplicates_total")?)?;
        *registry.duplicates.write() = Some(duplicates);

        let spec_hash_info = registry.gauge(take("g6_spec_hash_info")?)?;
        spec_hash_info.set(&[&catalogue::spec_hash()], 1.0);

        let build_hash_info = registry.gauge(take("g6_build_config_hash_info")?)?;
        if let Some(hash) = &registry.config.build_config_hash {
            build_hash_info.set(&[hash], 1.0);
        }

        let handles = Self {
            phase_attempts: registry.counter(take("g6_phase_attempts_total")?)?,
            phase_retries: registry.counter(take("g6_phase_retries_total")?)?,
            phase_outcomes: registry.counter(take("g6_phase_outcomes_total")?)?,
            phase_runs: registry.counter(take("g6_phase_runs_total")?)?,
            phase_duration_ms: registry.counter(take("g6_phase_duration_ms_total")?)?,
            phase_duration_seconds: registry.histogram(take("g6_phase_duration_seconds")?)?,
            phase_retry_backoff_seconds: registry
                .histogram(take("g6_phase_retry_backoff_seconds")?)?,
            phase_last_attempts: registry.gauge(take("g6_phase_last_attempts")?)?,
            cycle_success: registry.gauge(take("g6_cycle_success")?)?,
            cycle_error_ratio: registry.gauge(take("g6_cycle_error_ratio")?)?,
            cycles_total: registry.counter(take("g6_cycles_total")?)?,
            cycles_success_total: registry.counter(take("g6_cycles_success_total")?)?,
            cycle_success_rate_window: registry.gauge(take("g6_cycle_success_rate_window")?)?,
            cycle_error_rate_window: registry.gauge(take("g6_cycle_error_rate_window")?)?,
            trends_success_rate: registry.gauge(take("g6_trends_success_rate")?)?,
            trends_cycles: registry.gauge(take("g6_trends_cycles")?)?,
            index_success: registry.counter(take("g6_index_success_total")?)?,
            index_failures: registry.counter(take("g6_index_failures_total")?)?,
            index_fatal: registry.counter(take("g6_pipeline_index_fatal_total")?)?,
            cycle_duration_seconds: registry.histogram(take("g6_cycle_duration_seconds")?)?,
            cycles_skipped: registry.counter(take("g6_cycles_skipped_total")?)?,
            cycle_timeout: registry.counter(take("g6_cycle_timeout_total")?)?,
            heartbeat_timestamp: registry.gauge(take("g6_heartbeat_timestamp_seconds")?)?,
            uptime_seconds: registry.gauge(take("g6_collector_uptime_seconds")?)?,
            provider_cache_hits: registry.counter(take("g6_provider_cache_hits_total")?)?,
            provider_cache_misses: registry.counter(take("g6_provider_cache_misses_total")?)?,
            provider_cache_size: registry.gauge(take("g6_provider_cache_size")?)?,
            provider_cache_hit_ratio: registry.gauge(take("g6_provider_cache_hit_ratio")?)?,
            provider_health: registry.gauge(take("g6_provider_health")?)?,
            provider_auth_failures: registry.counter(take("g6_provider_auth_failures_total")?)?,
            provider_fallbacks: registry.counter(take("g6_provider_fallbacks_total")?)?,
            iv_success: registry.counter(take("g6_iv_estimation_success_total")?)?,
            iv_failure: registry.counter(take("g6_iv_estimation_failure_total")?)?,
            iv_avg_iterations: registry.gauge(take("g6_iv_estimation_avg_iterations")?)?,
            greeks_computed: registry.counter(take("g6_greeks_computed_total")?)?,
            greeks_math_failures: registry.counter(take("g6_greeks_math_failures_total")?)?,
            expiry_salvage: registry.counter(take("g6_expiry_salvage_total")?)?,
            expiry_fabricated: registry.counter(take("g6_expiry_fabricated_total")?)?,
            panel_writes: registry.counter(take("g6_panel_writes_total")?)?,
            panel_integrity_mismatches: registry
                .counter(take("g6_panel_integrity_mismatches_total")?)?,
            panel_integrity_ok: registry.gauge(take("g6_panel_integrity_ok")?)?,
            shadow_parity_ok_ratio: registry.gauge(take("g6_shadow_parity_ok_ratio")?)?,
            shadow_parity_score: registry.gauge(take("g6_shadow_parity_score")?)?,
            shadow_parity_window_size: registry.gauge(take("g6_shadow_parity_window_size")?)?,
            shadow_decisions: registry.counter(take("g6_shadow_decisions_total")?)?,
            shadow_protected_diffs: registry.counter(take("g6_shadow_protected_diffs_total")?)?,
            shadow_hash_churn_ratio: registry.gauge(take("g6_shadow_hash_churn_ratio")?)?,
            batch_queue_depth: registry.gauge(take("g6_metric_batch_queue_depth")?)?,
            batch_flush_duration: registry
                .histogram(take("g6_metric_batch_flush_duration_seconds")?)?,
            batch_flush_increments: registry.gauge(take("g6_metric_batch_flush_increments")?)?,
            batch_adaptive_target: registry.gauge(take("g6_metric_batch_adaptive_target")?)?,
            batch_shed: registry.counter(take("g6_metric_batch_shed_total")?)?,
            guard_offenders: registry.gauge(take("g6_cardinality_guard_offenders_total")?)?,
            guard_growth_percent: registry
                .gauge(take("g6_cardinality_guard_growth_percent")?)?,
            guard_series: registry.gauge(take("g6_cardinality_guard_series")?)?,
            guard_last_run: registry.gauge(take("g6_cardinality_guard_last_run_timestamp")?)?,
            lifecycle_deleted: registry.counter(take("g6_lifecycle_files_deleted_total")?)?,
            lifecycle_compression_candidates: registry
                .gauge(take("g6_lifecycle_compression_candidates")?)?,
        };

        debug_assert!(by_name.is_empty(), "unwired catalogue entries: {:?}",
                      by_name.keys().collect::<Vec<_>>());
        Ok(handles)
    }
}
