// =============================================================================
// Collector Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the G6 collection engine. Every tunable
// parameter lives here, loaded once at startup and passed by reference to
// the subsystems that need it.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file. Unknown keys are rejected in
// strict mode and logged as warnings otherwise.
//
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::GatingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_cycle_timeout_seconds() -> u64 {
    55
}

fn default_max_workers() -> usize {
    4
}

fn default_shutdown_timeout_seconds() -> u64 {
    10
}

fn default_heartbeat_interval_seconds() -> u64 {
    15
}

fn default_risk_free_rate() -> f64 {
    0.065
}

fn default_iv_max_iterations() -> u32 {
    100
}

fn default_iv_min() -> f64 {
    0.01
}

fn default_iv_max() -> f64 {
    5.0
}

fn default_iv_precision() -> f64 {
    0.01
}

fn default_fallback_iv() -> f64 {
    0.25
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    50
}

fn default_min_strike_coverage() -> f64 {
    0.5
}

fn default_redact_replacement() -> String {
    "[redacted]".to_string()
}

fn default_history_limit() -> usize {
    10
}

fn default_trends_limit() -> usize {
    200
}

fn default_parity_rolling_window() -> usize {
    200
}

fn default_anomaly_threshold() -> f64 {
    0.3
}

fn default_anomaly_min_total() -> usize {
    5
}

fn default_canary_target() -> f64 {
    0.97
}

fn default_parity_target() -> f64 {
    0.99
}

fn default_min_samples() -> usize {
    30
}

fn default_ok_hysteresis() -> u32 {
    10
}

fn default_fail_hysteresis() -> u32 {
    5
}

fn default_churn_rollback_threshold() -> f64 {
    0.5
}

fn default_protected_rollback_threshold() -> usize {
    3
}

fn default_canary_pct() -> f64 {
    100.0
}

fn default_batch_interval_ms() -> u64 {
    500
}

fn default_batch_min_size() -> usize {
    8
}

fn default_batch_max_size() -> usize {
    512
}

fn default_batch_flush_threshold() -> usize {
    256
}

fn default_cardinality_growth_percent() -> f64 {
    20.0
}

fn default_guard_interval_seconds() -> u64 {
    300
}

fn default_listen_addr() -> String {
    "0.0.0.0:9108".to_string()
}

fn default_provider_name() -> String {
    "sim".to_string()
}

fn default_exchange() -> String {
    "NFO".to_string()
}

fn default_instrument_cache_ttl() -> u64 {
    600
}

fn default_instrument_empty_ttl() -> u64 {
    30
}

fn default_quote_cache_ttl() -> f64 {
    1.0
}

fn default_rate_limit_per_sec() -> f64 {
    8.0
}

fn default_rate_limit_burst() -> f64 {
    16.0
}

fn default_throttle_interval_seconds() -> u64 {
    5
}

fn default_compression_extensions() -> Vec<String> {
    vec!["csv".to_string()]
}

fn default_compression_age_seconds() -> u64 {
    86_400
}

fn default_lifecycle_max_per_cycle() -> usize {
    25
}

fn default_retention_days() -> u32 {
    30
}

fn default_retention_delete_limit() -> usize {
    100
}

fn default_csv_dir() -> String {
    "data/options".to_string()
}

fn default_panels_dir() -> String {
    "data/panels".to_string()
}

fn default_index_params() -> HashMap<String, IndexParams> {
    let mut m = HashMap::new();
    m.insert("NIFTY".to_string(), IndexParams::default());
    m
}

fn default_expiries() -> Vec<String> {
    vec!["this_week".to_string(), "next_week".to_string()]
}

fn default_strike_depth() -> u32 {
    10
}

// =============================================================================
// Sections
// =============================================================================

/// Cycle scheduling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Seconds between cycle starts. Minimum 1.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Per-cycle wall-clock deadline. 0 disables the deadline.
    #[serde(default = "default_cycle_timeout_seconds")]
    pub cycle_timeout_seconds: u64,

    /// Worker pool ceiling. Effective pool size is min(indices, ceiling).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Run cycles even when the market-hours oracle says closed.
    #[serde(default)]
    pub force_open: bool,

    /// Grace period for in-flight work during graceful shutdown.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    /// Heartbeat gauge update interval (independent of market hours).
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            cycle_timeout_seconds: default_cycle_timeout_seconds(),
            max_workers: default_max_workers(),
            force_open: false,
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
        }
    }
}

/// Per-index collection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexParams {
    /// Expiry rule tokens to collect ("this_week", ...).
    #[serde(default = "default_expiries")]
    pub expiries: Vec<String>,

    /// Strike ladder depth above ATM.
    #[serde(default = "default_strike_depth")]
    pub strikes_otm: u32,

    /// Strike ladder depth below ATM.
    #[serde(default = "default_strike_depth")]
    pub strikes_itm: u32,

    #[serde(default = "default_true")]
    pub enable: bool,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            expiries: default_expiries(),
            strikes_otm: default_strike_depth(),
            strikes_itm: default_strike_depth(),
            enable: true,
        }
    }
}

/// IV estimation and greeks computation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeksConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub estimate_iv: bool,

    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,

    #[serde(default = "default_iv_max_iterations")]
    pub iv_max_iterations: u32,

    #[serde(default = "default_iv_min")]
    pub iv_min: f64,

    #[serde(default = "default_iv_max")]
    pub iv_max: f64,

    /// Absolute price error tolerance for the Newton-Raphson solver.
    #[serde(default = "default_iv_precision")]
    pub iv_precision: f64,

    /// IV used by the greeks phase when no solved or provided IV exists.
    #[serde(default = "default_fallback_iv")]
    pub fallback_iv: f64,
}

impl Default for GreeksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            estimate_iv: false,
            risk_free_rate: default_risk_free_rate(),
            iv_max_iterations: default_iv_max_iterations(),
            iv_min: default_iv_min(),
            iv_max: default_iv_max(),
            iv_precision: default_iv_precision(),
            fallback_iv: default_fallback_iv(),
        }
    }
}

/// Pipeline executor, phase, and panel-export parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // --- Retry policy --------------------------------------------------------
    #[serde(default)]
    pub retry_enabled: bool,

    /// Inclusive of the initial attempt. Values below 1 are clamped to 1.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default)]
    pub retry_jitter_ms: u64,

    // --- Metrics -------------------------------------------------------------
    #[serde(default = "default_true")]
    pub phase_metrics_enabled: bool,

    /// Rolling window of cycle outcomes feeding the window gauges. 0 disables.
    #[serde(default)]
    pub rolling_window: usize,

    // --- Phase settings ------------------------------------------------------
    #[serde(default)]
    pub prefilter_min_volume: u64,

    #[serde(default)]
    pub prefilter_min_open_interest: u64,

    /// Keep instruments at or above this volume percentile (0..100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefilter_volume_percentile: Option<f64>,

    #[serde(default = "default_min_strike_coverage")]
    pub validate_min_strike_coverage: f64,

    /// Whether fabricated expiries pass the validate phase.
    #[serde(default = "default_true")]
    pub fabricated_passes_validate: bool,

    #[serde(default)]
    pub salvage_enabled: bool,

    /// Relaxed prefix-based root matching instead of strict symbol roots.
    #[serde(default)]
    pub legacy_root_matching: bool,

    // --- Structured errors ---------------------------------------------------
    /// Attach provider hints and truncated traces to fatal/unknown records.
    #[serde(default = "default_true")]
    pub error_enrichment: bool,

    /// Emit the `pipeline.structured_errors` stdout line per cycle.
    #[serde(default)]
    pub structured_errors_stdout: bool,

    #[serde(default)]
    pub redact_patterns: Vec<String>,

    #[serde(default = "default_redact_replacement")]
    pub redact_replacement: String,

    // --- Parity --------------------------------------------------------------
    #[serde(default)]
    pub parity_extended: bool,

    #[serde(default = "default_parity_rolling_window")]
    pub parity_rolling_window: usize,

    /// Component weight overrides, "comp:weight,comp:weight".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parity_weights: Option<String>,

    #[serde(default = "default_anomaly_threshold")]
    pub parity_alert_anomaly_threshold: f64,

    #[serde(default = "default_anomaly_min_total")]
    pub parity_alert_anomaly_min_total: usize,

    // --- Panels --------------------------------------------------------------
    #[serde(default = "default_true")]
    pub panel_export_enabled: bool,

    #[serde(default)]
    pub panel_export_history_enabled: bool,

    #[serde(default = "default_history_limit")]
    pub panel_export_history_limit: usize,

    /// Include a content_hash in the errors summary export.
    #[serde(default)]
    pub panel_export_hash: bool,

    /// Write pipeline_config_snapshot.json before phases run.
    #[serde(default)]
    pub config_snapshot: bool,

    #[serde(default)]
    pub trends_enabled: bool,

    /// Trend file prune limit. Minimum 1.
    #[serde(default = "default_trends_limit")]
    pub trends_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty pipeline config deserialises")
    }
}

/// Shadow gating thresholds and scoping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowGatingConfig {
    #[serde(default)]
    pub mode: GatingMode,

    #[serde(default = "default_canary_target")]
    pub canary_target: f64,

    #[serde(default = "default_parity_target")]
    pub parity_target: f64,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_ok_hysteresis")]
    pub ok_hysteresis: u32,

    #[serde(default = "default_fail_hysteresis")]
    pub fail_hysteresis: u32,

    /// Protected fields beyond the built-in {expiry_date, instrument_count}.
    #[serde(default)]
    pub protected_fields: Vec<String>,

    /// Distinct-hash churn ratio at or above which the window rolls back.
    #[serde(default = "default_churn_rollback_threshold")]
    pub churn_rollback_threshold: f64,

    /// Optional separate window size for churn scoring. 0 uses the main window.
    #[serde(default)]
    pub churn_window: usize,

    /// Protected diffs in window at or above which the window rolls back.
    #[serde(default = "default_protected_rollback_threshold")]
    pub protected_rollback_threshold: usize,

    /// Explicit canary index allowlist. Wins over `canary_pct` when non-empty.
    #[serde(default)]
    pub canary_indices: Vec<String>,

    #[serde(default = "default_canary_pct")]
    pub canary_pct: f64,

    #[serde(default)]
    pub force_demote: bool,

    #[serde(default)]
    pub authoritative: bool,

    /// Severity → weight map for the weighted alert parity score.
    #[serde(default)]
    pub alert_severity_weights: HashMap<String, f64>,
}

impl Default for ShadowGatingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty shadow gating config deserialises")
    }
}

/// Counter batcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_batch_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_batch_min_size")]
    pub min_size: usize,

    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,

    /// Distinct-key count that forces an early flush.
    #[serde(default = "default_batch_flush_threshold")]
    pub flush_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty batch config deserialises")
    }
}

/// Metrics registry gating and exposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Group whitelist. Empty means all groups pass this filter.
    #[serde(default)]
    pub enable_groups: Vec<String>,

    /// Group blacklist, applied after the whitelist.
    #[serde(default)]
    pub disable_groups: Vec<String>,

    /// Escalate guard breaches and integrity mismatches to process exit.
    #[serde(default)]
    pub strict_exceptions: bool,

    /// Error on duplicate metric registration instead of returning the
    /// existing handle.
    #[serde(default)]
    pub fail_on_duplicate: bool,

    #[serde(default)]
    pub batch: BatchConfig,

    /// Baseline series-count snapshot for the cardinality guard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality_baseline_path: Option<String>,

    /// Per-group growth percent over baseline that flags an offender.
    #[serde(default = "default_cardinality_growth_percent")]
    pub cardinality_growth_percent: f64,

    #[serde(default = "default_guard_interval_seconds")]
    pub guard_interval_seconds: u64,

    /// Bind address for the metrics/status HTTP server.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Deployment-time configuration hash surfaced as a labeled gauge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_config_hash: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty metrics config deserialises")
    }
}

/// Provider facade tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub default_provider: String,

    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_instrument_cache_ttl")]
    pub instrument_cache_ttl_seconds: u64,

    /// Short TTL applied when the provider returns an empty universe, to
    /// avoid tight refetch loops.
    #[serde(default = "default_instrument_empty_ttl")]
    pub instrument_empty_ttl_seconds: u64,

    /// Quote cache TTL in seconds. 0 disables quote caching.
    #[serde(default = "default_quote_cache_ttl")]
    pub quote_cache_ttl_seconds: f64,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: f64,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: f64,

    /// Minimum interval between throttled fallback warnings.
    #[serde(default = "default_throttle_interval_seconds")]
    pub throttle_log_interval_seconds: u64,

    /// Per-index ATM strike step overrides.
    #[serde(default)]
    pub strike_steps: HashMap<String, f64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty provider config deserialises")
    }
}

/// Data file retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_compression_extensions")]
    pub compression_extensions: Vec<String>,

    #[serde(default = "default_compression_age_seconds")]
    pub compression_age_seconds: u64,

    #[serde(default = "default_lifecycle_max_per_cycle")]
    pub max_per_cycle: usize,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_retention_delete_limit")]
    pub retention_delete_limit: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty lifecycle config deserialises")
    }
}

/// Output directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_csv_dir")]
    pub csv_dir: String,

    #[serde(default = "default_panels_dir")]
    pub panels_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            csv_dir: default_csv_dir(),
            panels_dir: default_panels_dir(),
        }
    }
}

// =============================================================================
// CollectorConfig
// =============================================================================

/// Top-level configuration for the G6 collection engine.
///
/// Every field has a serde default so that older JSON files missing new
/// sections still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Reject unknown config keys instead of warning.
    #[serde(default)]
    pub strict: bool,

    #[serde(default)]
    pub collection: CollectionConfig,

    #[serde(default = "default_index_params")]
    pub index_params: HashMap<String, IndexParams>,

    #[serde(default)]
    pub greeks: GreeksConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub shadow_gating: ShadowGatingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty collector config deserialises")
    }
}

/// Recognised top-level sections, used for the unknown-key check.
const KNOWN_SECTIONS: &[&str] = &[
    "strict",
    "collection",
    "index_params",
    "greeks",
    "pipeline",
    "shadow_gating",
    "metrics",
    "provider",
    "lifecycle",
    "storage",
];

impl CollectorConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read collector config from {}", path.display()))?;

        let raw: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse collector config from {}", path.display()))?;

        let strict = raw
            .get("strict")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Self::check_unknown_keys(&raw, strict)?;

        let config: Self = serde_json::from_value(raw)
            .with_context(|| format!("failed to decode collector config from {}", path.display()))?;
        config.validate()?;

        info!(
            path = %path.display(),
            indices = ?config.enabled_indices(),
            interval_seconds = config.collection.interval_seconds,
            gating_mode = %config.shadow_gating.mode,
            "collector config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise collector config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "collector config saved (atomic)");
        Ok(())
    }

    /// Indices with `enable = true`, sorted for deterministic dispatch order.
    pub fn enabled_indices(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .index_params
            .iter()
            .filter(|(_, p)| p.enable)
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }

    /// Range checks that serde cannot express.
    fn validate(&self) -> Result<()> {
        if self.collection.interval_seconds < 1 {
            anyhow::bail!("collection.interval_seconds must be >= 1");
        }
        if self.pipeline.trends_limit < 1 {
            anyhow::bail!("pipeline.trends_limit must be >= 1");
        }
        for (index, params) in &self.index_params {
            for token in &params.expiries {
                if crate::types::ExpiryRule::parse(token).is_none() {
                    anyhow::bail!("index_params.{index}: unknown expiry rule '{token}'");
                }
            }
        }
        Ok(())
    }

    fn check_unknown_keys(raw: &serde_json::Value, strict: bool) -> Result<()> {
        let Some(map) = raw.as_object() else {
            anyhow::bail!("collector config root must be a JSON object");
        };
        for key in map.keys() {
            if !KNOWN_SECTIONS.contains(&key.as_str()) {
                if strict {
                    anyhow::bail!("unknown config section '{key}' (strict mode)");
                }
                warn!(section = %key, "ignoring unknown config section");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = CollectorConfig::default();
        assert_eq!(cfg.collection.interval_seconds, 60);
        assert_eq!(cfg.collection.max_workers, 4);
        assert!(!cfg.pipeline.retry_enabled);
        assert_eq!(cfg.pipeline.retry_max_attempts, 3);
        assert_eq!(cfg.pipeline.retry_base_ms, 50);
        assert_eq!(cfg.pipeline.retry_jitter_ms, 0);
        assert_eq!(cfg.shadow_gating.mode, GatingMode::Off);
        assert!((cfg.shadow_gating.canary_target - 0.97).abs() < f64::EPSILON);
        assert!((cfg.shadow_gating.parity_target - 0.99).abs() < f64::EPSILON);
        assert_eq!(cfg.shadow_gating.min_samples, 30);
        assert_eq!(cfg.shadow_gating.ok_hysteresis, 10);
        assert_eq!(cfg.shadow_gating.fail_hysteresis, 5);
        assert_eq!(cfg.pipeline.parity_rolling_window, 200);
        assert!((cfg.greeks.fallback_iv - 0.25).abs() < f64::EPSILON);
        assert!(cfg.metrics.batch.enabled);
        assert_eq!(cfg.pipeline.trends_limit, 200);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: CollectorConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.index_params.contains_key("NIFTY"));
        assert!(!cfg.greeks.enabled);
        assert_eq!(cfg.provider.default_provider, "sim");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "collection": { "interval_seconds": 30 },
            "greeks": { "enabled": true, "estimate_iv": true }
        }"#;
        let cfg: CollectorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.collection.interval_seconds, 30);
        assert!(cfg.greeks.enabled);
        assert_eq!(cfg.collection.max_workers, 4);
        assert!(!cfg.pipeline.retry_enabled);
    }

    #[test]
    fn unknown_section_rejected_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "strict": true, "colection": {} }"#).unwrap();
        let err = CollectorConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("unknown config section"));
    }

    #[test]
    fn unknown_section_tolerated_when_not_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "colection": {} }"#).unwrap();
        let cfg = CollectorConfig::load(&path).unwrap();
        assert_eq!(cfg.collection.interval_seconds, 60);
    }

    #[test]
    fn bad_expiry_rule_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "index_params": { "NIFTY": { "expiries": ["mid_week"] } } }"#,
        )
        .unwrap();
        let err = CollectorConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("unknown expiry rule"));
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = CollectorConfig::default();
        cfg.pipeline.retry_enabled = true;
        cfg.pipeline.retry_max_attempts = 5;
        cfg.save(&path).unwrap();

        let loaded = CollectorConfig::load(&path).unwrap();
        assert!(loaded.pipeline.retry_enabled);
        assert_eq!(loaded.pipeline.retry_max_attempts, 5);
    }

    #[test]
    fn enabled_indices_sorted_and_filtered() {
        let mut cfg = CollectorConfig::default();
        cfg.index_params.insert(
            "BANKNIFTY".to_string(),
            IndexParams::default(),
        );
        cfg.index_params.insert(
            "FINNIFTY".to_string(),
            IndexParams {
                enable: false,
                ..IndexParams::default()
            },
        );
        assert_eq!(cfg.enabled_indices(), vec!["BANKNIFTY", "NIFTY"]);
    }
}
