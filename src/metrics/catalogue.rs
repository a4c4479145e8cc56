// =============================================================================
// Metric catalogue — the full metric surface declared as data
// =============================================================================
//
// Every metric the engine can emit is declared here once. The registry walks
// this catalogue at startup, applies group gating, and builds handles. The
// spec hash embedded in `g6_spec_hash_info` is computed over the canonical
// sorted rendering of these entries, so any catalogue edit is visible as a
// provenance change on dashboards.
// =============================================================================

/// Metric families supported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// Gating groups. A subset is always-on and bypasses the enable/disable
/// lists for operator safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricGroup {
    Cache,
    Lifecycle,
    PanelDiff,
    AnalyticsVolSurface,
    AnalyticsRiskAgg,
    ProviderFailover,
    ExpiryRemediation,
    IvEstimation,
    SlaHealth,
    AdaptiveController,
    Pipeline,
    Bus,
    ColumnStore,
    Stream,
}

impl MetricGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Lifecycle => "lifecycle",
            Self::PanelDiff => "panel_diff",
            Self::AnalyticsVolSurface => "analytics_vol_surface",
            Self::AnalyticsRiskAgg => "analytics_risk_agg",
            Self::ProviderFailover => "provider_failover",
            Self::ExpiryRemediation => "expiry_remediation",
            Self::IvEstimation => "iv_estimation",
            Self::SlaHealth => "sla_health",
            Self::AdaptiveController => "adaptive_controller",
            Self::Pipeline => "pipeline",
            Self::Bus => "bus",
            Self::ColumnStore => "column_store",
            Self::Stream => "stream",
        }
    }

    /// Groups that cannot be pruned by the enable/disable lists.
    pub fn always_on(self) -> bool {
        matches!(
            self,
            Self::ExpiryRemediation
                | Self::ProviderFailover
                | Self::AdaptiveController
                | Self::IvEstimation
                | Self::SlaHealth
        )
    }
}

/// One catalogue entry. `predicate` runs at registration time; a false
/// result suppresses the metric even inside an always-on group.
#[derive(Clone)]
pub struct MetricSpec {
    pub name: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
    pub help: &'static str,
    pub group: MetricGroup,
    pub cardinality_budget: usize,
    pub predicate: Option<fn() -> bool>,
    pub buckets: Option<&'static [f64]>,
}

impl MetricSpec {
    const fn counter(
        name: &'static str,
        labels: &'static [&'static str],
        help: &'static str,
        group: MetricGroup,
        budget: usize,
    ) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            labels,
            help,
            group,
            cardinality_budget: budget,
            predicate: None,
            buckets: None,
        }
    }

    const fn gauge(
        name: &'static str,
        labels: &'static [&'static str],
        help: &'static str,
        group: MetricGroup,
        budget: usize,
    ) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
            labels,
            help,
            group,
            cardinality_budget: budget,
            predicate: None,
            buckets: None,
        }
    }

    const fn histogram(
        name: &'static str,
        labels: &'static [&'static str],
        help: &'static str,
        group: MetricGroup,
        budget: usize,
        buckets: &'static [f64],
    ) -> Self {
        Self {
            name,
            kind: MetricKind::Histogram,
            labels,
            help,
            group,
            cardinality_budget: budget,
            predicate: None,
            buckets: Some(buckets),
        }
    }
}

/// Latency buckets for sub-second phase work.
pub const PHASE_SECONDS_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Buckets for whole-cycle durations.
pub const CYCLE_SECONDS_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 45.0, 60.0];

/// Buckets for retry backoff sleeps (capped at 5 s).
pub const BACKOFF_SECONDS_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Buckets for batcher flush work.
pub const FLUSH_SECONDS_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1];

/// The full catalogue, sorted by name.
pub fn catalogue() -> Vec<MetricSpec> {
    use MetricGroup::*;

    let mut specs = vec![
        // --- pipeline: phase execution ---------------------------------------
        MetricSpec::counter(
            "g6_phase_attempts_total",
            &["phase"],
            "Phase attempts including retries",
            Pipeline,
            16,
        ),
        MetricSpec::counter(
            "g6_phase_retries_total",
            &["phase"],
            "Phase attempts beyond the first",
            Pipeline,
            16,
        ),
        MetricSpec::counter(
            "g6_phase_outcomes_total",
            &["phase", "final_outcome"],
            "Final outcome per phase execution sequence",
            Pipeline,
            96,
        ),
        MetricSpec::counter(
            "g6_phase_runs_total",
            &["phase", "final_outcome"],
            "Phase execution sequences by final outcome",
            Pipeline,
            96,
        ),
        MetricSpec::counter(
            "g6_phase_duration_ms_total",
            &["phase", "final_outcome"],
            "Wall time summed across attempts, milliseconds",
            Pipeline,
            96,
        ),
        MetricSpec::histogram(
            "g6_phase_duration_seconds",
            &["phase", "final_outcome"],
            "Total phase duration across attempts",
            Pipeline,
            96,
            PHASE_SECONDS_BUCKETS,
        ),
        MetricSpec::histogram(
            "g6_phase_retry_backoff_seconds",
            &["phase"],
            "Backoff sleep before a retry attempt",
            Pipeline,
            16,
            BACKOFF_SECONDS_BUCKETS,
        ),
        MetricSpec::gauge(
            "g6_phase_last_attempts",
            &["phase"],
            "Attempts consumed by the most recent execution sequence",
            Pipeline,
            16,
        ),
        // --- pipeline: cycles -------------------------------------------------
        MetricSpec::gauge("g6_cycle_success", &[], "Last cycle fully succeeded", Pipeline, 1),
        MetricSpec::gauge(
            "g6_cycle_error_ratio",
            &[],
            "phases_error / phases_total for the last cycle",
            Pipeline,
            1,
        ),
        MetricSpec::counter("g6_cycles_total", &[], "Cycles executed", Pipeline, 1),
        MetricSpec::counter(
            "g6_cycles_success_total",
            &[],
            "Cycles with no failed phases",
            Pipeline,
            1,
        ),
        MetricSpec::gauge(
            "g6_cycle_success_rate_window",
            &[],
            "Success rate over the rolling cycle window",
            Pipeline,
            1,
        ),
        MetricSpec::gauge(
            "g6_cycle_error_rate_window",
            &[],
            "Error rate over the rolling cycle window",
            Pipeline,
            1,
        ),
        MetricSpec::gauge(
            "g6_trends_success_rate",
            &[],
            "Success rate from the trends aggregation file",
            Pipeline,
            1,
        ),
        MetricSpec::gauge(
            "g6_trends_cycles",
            &[],
            "Cycle count from the trends aggregation file",
            Pipeline,
            1,
        ),
        MetricSpec::counter(
            "g6_index_success_total",
            &["index"],
            "Per-index successful collections",
            Pipeline,
            32,
        ),
        MetricSpec::counter(
            "g6_index_failures_total",
            &["index"],
            "Per-index failed collections",
            Pipeline,
            32,
        ),
        MetricSpec::counter(
            "g6_pipeline_index_fatal_total",
            &["index"],
            "Indices marked failed by a fatal phase outcome",
            Pipeline,
            32,
        ),
        // --- sla_health -------------------------------------------------------
        MetricSpec::histogram(
            "g6_cycle_duration_seconds",
            &[],
            "Wall time of a full collection cycle",
            SlaHealth,
            1,
            CYCLE_SECONDS_BUCKETS,
        ),
        MetricSpec::counter(
            "g6_cycles_skipped_total",
            &["reason"],
            "Cycles skipped (market closed, overrun)",
            SlaHealth,
            8,
        ),
        MetricSpec::counter(
            "g6_cycle_timeout_total",
            &[],
            "Cycles cancelled at the wall-clock deadline",
            SlaHealth,
            1,
        ),
        MetricSpec::gauge(
            "g6_heartbeat_timestamp_seconds",
            &[],
            "Epoch seconds of the last heartbeat",
            SlaHealth,
            1,
        ),
        MetricSpec::gauge(
            "g6_collector_uptime_seconds",
            &[],
            "Seconds since process start",
            SlaHealth,
            1,
        ),
        MetricSpec::counter(
            "g6_metric_duplicates_total",
            &["name"],
            "Duplicate metric registration attempts",
            SlaHealth,
            64,
        ),
        MetricSpec::gauge(
            "g6_spec_hash_info",
            &["hash"],
            "Static catalogue provenance hash",
            SlaHealth,
            1,
        ),
        MetricSpec::gauge(
            "g6_build_config_hash_info",
            &["hash"],
            "Deployment-time configuration hash",
            SlaHealth,
            1,
        ),
        // --- cardinality guard ------------------------------------------------
        MetricSpec::gauge(
            "g6_cardinality_guard_offenders_total",
            &[],
            "Groups over their cardinality growth threshold",
            AdaptiveController,
            1,
        ),
        MetricSpec::gauge(
            "g6_cardinality_guard_growth_percent",
            &["group"],
            "Series growth percent over baseline per group",
            AdaptiveController,
            16,
        ),
        MetricSpec::gauge(
            "g6_cardinality_guard_series",
            &["group"],
            "Live series count per group",
            AdaptiveController,
            16,
        ),
        MetricSpec::gauge(
            "g6_cardinality_guard_last_run_timestamp",
            &[],
            "Epoch seconds of the last guard sweep",
            AdaptiveController,
            1,
        ),
        // --- batcher ----------------------------------------------------------
        MetricSpec::gauge(
            "g6_metric_batch_queue_depth",
            &[],
            "Pending increments in the batcher queue",
            AdaptiveController,
            1,
        ),
        MetricSpec::histogram(
            "g6_metric_batch_flush_duration_seconds",
            &[],
            "Batcher flush wall time",
            AdaptiveController,
            1,
            FLUSH_SECONDS_BUCKETS,
        ),
        MetricSpec::gauge(
            "g6_metric_batch_flush_increments",
            &[],
            "Increments applied by the last flush",
            AdaptiveController,
            1,
        ),
        MetricSpec::gauge(
            "g6_metric_batch_adaptive_target",
            &[],
            "Current adaptive flush target",
            AdaptiveController,
            1,
        ),
        MetricSpec::counter(
            "g6_metric_batch_shed_total",
            &[],
            "Increments dropped in shed mode",
            AdaptiveController,
            1,
        ),
        // --- provider ---------------------------------------------------------
        MetricSpec::counter(
            "g6_provider_cache_hits_total",
            &[],
            "Provider cache hits",
            Cache,
            1,
        ),
        MetricSpec::counter(
            "g6_provider_cache_misses_total",
            &[],
            "Provider cache misses",
            Cache,
            1,
        ),
        MetricSpec::gauge(
            "g6_provider_cache_size",
            &["cache"],
            "Entries per provider cache",
            Cache,
            4,
        ),
        MetricSpec::gauge(
            "g6_provider_cache_hit_ratio",
            &[],
            "Provider cache hit ratio",
            Cache,
            1,
        ),
        MetricSpec::gauge(
            "g6_provider_health",
            &[],
            "Provider health (1 healthy, 0.5 degraded, 0 unhealthy)",
            ProviderFailover,
            1,
        ),
        MetricSpec::counter(
            "g6_provider_auth_failures_total",
            &[],
            "Authentication failures from the provider",
            ProviderFailover,
            1,
        ),
        MetricSpec::counter(
            "g6_provider_fallbacks_total",
            &["sink"],
            "Throttled fallback warnings per sink",
            ProviderFailover,
            4,
        ),
        // --- iv / greeks ------------------------------------------------------
        MetricSpec::counter(
            "g6_iv_estimation_success_total",
            &["index", "expiry"],
            "Converged IV solves",
            IvEstimation,
            256,
        ),
        MetricSpec::counter(
            "g6_iv_estimation_failure_total",
            &["index", "expiry"],
            "Diverged or out-of-bound IV solves",
            IvEstimation,
            256,
        ),
        MetricSpec::gauge(
            "g6_iv_estimation_avg_iterations",
            &["index"],
            "Average solver iterations per converged option, last cycle",
            IvEstimation,
            32,
        ),
        MetricSpec::counter(
            "g6_greeks_computed_total",
            &["index"],
            "Options with a full greeks vector",
            AnalyticsRiskAgg,
            32,
        ),
        MetricSpec::counter(
            "g6_greeks_math_failures_total",
            &["index"],
            "Per-instrument greek computation failures",
            AnalyticsRiskAgg,
            32,
        ),
        // --- remediation ------------------------------------------------------
        MetricSpec::counter(
            "g6_expiry_salvage_total",
            &["index"],
            "Expiries repaired by the salvage phase",
            ExpiryRemediation,
            32,
        ),
        MetricSpec::counter(
            "g6_expiry_fabricated_total",
            &["index"],
            "Expiries fabricated from near-Thursdays",
            ExpiryRemediation,
            32,
        ),
        // --- panels -----------------------------------------------------------
        MetricSpec::counter(
            "g6_panel_writes_total",
            &["panel"],
            "Panel envelope writes",
            PanelDiff,
            32,
        ),
        MetricSpec::counter(
            "g6_panel_integrity_mismatches_total",
            &[],
            "Manifest hash mismatches found by the integrity monitor",
            PanelDiff,
            1,
        ),
        MetricSpec::gauge(
            "g6_panel_integrity_ok",
            &[],
            "1 while the last integrity sweep found no mismatches",
            PanelDiff,
            1,
        ),
        // --- shadow parity ----------------------------------------------------
        MetricSpec::gauge(
            "g6_shadow_parity_ok_ratio",
            &[],
            "Parity-ok ratio over the rolling window",
            Pipeline,
            1,
        ),
        MetricSpec::gauge(
            "g6_shadow_parity_score",
            &[],
            "Component parity score for the last shadowed cycle",
            Pipeline,
            1,
        ),
        MetricSpec::gauge(
            "g6_shadow_parity_window_size",
            &[],
            "Samples in the parity window",
            Pipeline,
            1,
        ),
        MetricSpec::counter(
            "g6_shadow_decisions_total",
            &["reason"],
            "Gating decisions by reason token",
            Pipeline,
            16,
        ),
        MetricSpec::counter(
            "g6_shadow_protected_diffs_total",
            &[],
            "Samples with a protected-field diff",
            Pipeline,
            1,
        ),
        MetricSpec::gauge(
            "g6_shadow_hash_churn_ratio",
            &[],
            "Distinct parity hashes / window size",
            Pipeline,
            1,
        ),
        // --- lifecycle --------------------------------------------------------
        MetricSpec::counter(
            "g6_lifecycle_files_deleted_total",
            &[],
            "Data files removed by retention",
            Lifecycle,
            1,
        ),
        MetricSpec::gauge(
            "g6_lifecycle_compression_candidates",
            &[],
            "Files eligible for compression at the last sweep",
            Lifecycle,
            1,
        ),
    ];

    specs.sort_by_key(|s| s.name);
    specs
}

/// First 16 hex chars of SHA-256 over the canonical sorted catalogue.
pub fn spec_hash() -> String {
    use sha2::{Digest, Sha256};

    let mut canonical = String::new();
    for spec in catalogue() {
        canonical.push_str(spec.name);
        canonical.push('|');
        canonical.push_str(spec.kind.as_str());
        canonical.push('|');
        canonical.push_str(&spec.labels.join(","));
        canonical.push('|');
        canonical.push_str(spec.group.as_str());
        canonical.push('|');
        canonical.push_str(spec.help);
        canonical.push('\n');
    }

    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_names_unique_and_sorted() {
        let specs = catalogue();
        for pair in specs.windows(2) {
            assert!(pair[0].name < pair[1].name, "{} >= {}", pair[0].name, pair[1].name);
        }
    }

    #[test]
    fn counters_end_in_total() {
        for spec in catalogue() {
            if spec.kind == MetricKind::Counter {
                assert!(spec.name.ends_with("_total"), "{}", spec.name);
            }
            assert!(spec.name.starts_with("g6_"), "{}", spec.name);
        }
    }

    #[test]
    fn histograms_declare_buckets() {
        for spec in catalogue() {
            if spec.kind == MetricKind::Histogram {
                assert!(spec.buckets.is_some(), "{}", spec.name);
            }
        }
    }

    #[test]
    fn spec_hash_is_stable_16_hex() {
        let a = spec_hash();
        let b = spec_hash();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
