// =============================================================================
// Cycle Orchestrator — market-hours-gated collection on a fixed interval
// =============================================================================
//
// Every interval tick the orchestrator consults the market-hours oracle,
// dispatches one work item per enabled index onto a bounded worker pool,
// runs the pipeline per configured expiry rule, aggregates the per-index
// overview, feeds the shadow gating controller, and emits panels. A panic
// or failure in one index never aborts the others; a cycle that outruns its
// wall-clock deadline is cancelled and discarded.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::events::StructuredEvent;
use crate::market_hours;
use crate::metrics::{BatcherHandle, MetricsHandles};
use crate::panels::PanelsWriter;
use crate::parity::{
    digest_state, parity_score, AlertSample, GatingController, ParitySample, ScoreInputs,
    StateDigest,
};
use crate::pipeline::summary::{read_trends_aggregate, RollingWindow};
use crate::pipeline::{
    EventSink, ExpiryState, PhaseContext, PhaseErrorRecord, PipelineExecutor, PipelineRunResult,
    PipelineSummary,
};
use crate::provider::{HealthStatus, ProviderFacade};
use crate::sinks::OptionSink;
use crate::state::CollectorState;
use crate::types::{ExpiryRule, OverviewSnapshot};

/// Result of one expiry's processing inside a worker.
struct ExpiryOutcome {
    rule: ExpiryRule,
    state: ExpiryState,
    result: PipelineRunResult,
    shadow: Option<ShadowComparison>,
}

/// Everything the gating layer needs from one shadowed expiry.
struct ShadowComparison {
    sample: ParitySample,
    legacy: StateDigest,
    shadow: StateDigest,
    legacy_alerts: Vec<AlertSample>,
    shadow_alerts: Vec<AlertSample>,
}

/// Alert population of a processed state: every structured error record
/// contributes its message as the category and its classification as the
/// severity.
fn alerts_of(state: &ExpiryState) -> Vec<AlertSample> {
    state
        .error_records
        .iter()
        .map(|r| AlertSample {
            category: r.message.clone(),
            severity: r.classification.clone(),
        })
        .collect()
}

pub struct Orchestrator {
    config: Arc<CollectorConfig>,
    state: Arc<CollectorState>,
    provider: Arc<ProviderFacade>,
    metrics: MetricsHandles,
    batcher: BatcherHandle,
    sinks: Arc<Vec<Arc<dyn OptionSink>>>,
    executor: Arc<PipelineExecutor>,
    panels: PanelsWriter,
    gating: Mutex<GatingController>,
    rolling: Mutex<RollingWindow>,
    redactors: Arc<Vec<regex::Regex>>,
    provider_names: Vec<String>,
    emit: EventSink,
    /// Last synced provider counter values (hits, misses, fallbacks,
    /// quote fallbacks), for delta-based counter updates.
    provider_sync: Mutex<(u64, u64, u64, u64)>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<CollectorConfig>,
        state: Arc<CollectorState>,
        provider: Arc<ProviderFacade>,
        metrics: MetricsHandles,
        batcher: BatcherHandle,
        sinks: Vec<Arc<dyn OptionSink>>,
        provider_names: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let redactors: Vec<regex::Regex> = config
            .pipeline
            .redact_patterns
            .iter()
            .filter_map(|p| match regex::Regex::new(p) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "ignoring invalid redaction pattern");
                    None
                }
            })
            .collect();

        let panels = PanelsWriter::new(&config.storage.panels_dir, config.pipeline.clone());
        let gating = GatingController::new(
            config.shadow_gating.clone(),
            config.pipeline.parity_rolling_window,
        );
        let rolling = RollingWindow::new(config.pipeline.rolling_window);

        let emit_state = state.clone();
        let emit: EventSink = Arc::new(move |event: StructuredEvent| {
            event.log();
            emit_state.push_event(event);
        });

        let orchestrator = Self {
            config,
            state,
            provider,
            metrics,
            batcher,
            sinks: Arc::new(sinks),
            executor: Arc::new(PipelineExecutor::standard()),
            panels,
            gating: Mutex::new(gating),
            rolling: Mutex::new(rolling),
            redactors: Arc::new(redactors),
            provider_names,
            emit,
            provider_sync: Mutex::new((0, 0, 0, 0)),
            shutdown,
        };
        orchestrator.startup_summaries();
        orchestrator
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run cycles until the shutdown signal fires. The caller flushes the
    /// batcher and sinks after this returns.
    pub async fn run(mut self) {
        let interval = Duration::from_secs(self.config.collection.interval_seconds.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_seconds = self.config.collection.interval_seconds,
            indices = ?self.config.enabled_indices(),
            "orchestrator started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }

            if !self.should_collect() {
                self.batcher
                    .inc(&self.metrics.cycles_skipped, &["market_closed"], 1.0);
                let wait = market_hours::seconds_to_open(chrono::Utc::now());
                debug!(next_open_in_s = wait, "market closed, cycle skipped");
                continue;
            }

            self.run_cycle().await;
        }

        info!("orchestrator stopping, flushing sinks");
        for sink in self.sinks.iter() {
            if let Err(e) = sink.flush() {
                warn!(sink = sink.name(), error = %e, "sink flush failed on shutdown");
            }
        }
        self.batcher.flush();
    }

    fn should_collect(&self) -> bool {
        self.config.collection.force_open || market_hours::is_open()
    }

    // -------------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------------

    pub async fn run_cycle(&self) {
        let started = Instant::now();
        let cycle_ts = chrono::Utc::now().timestamp();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = self.build_context(cycle_ts, cancel_rx);

        self.write_config_snapshot();

        let indices = self.config.enabled_indices();
        let deadline = self.config.collection.cycle_timeout_seconds;

        let work = self.dispatch_indices(&ctx, &indices);
        let outcomes = if deadline > 0 {
            match tokio::time::timeout(Duration::from_secs(deadline), work).await {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    let _ = cancel_tx.send(true);
                    self.batcher.inc(&self.metrics.cycle_timeout, &[], 1.0);
                    self.batcher
                        .inc(&self.metrics.cycles_skipped, &["overrun"], 1.0);
                    (self.emit)(StructuredEvent::new("cycle.timeout").with_detail(
                        serde_json::json!({"deadline_seconds": deadline}),
                    ));
                    warn!(deadline_seconds = deadline, "cycle cancelled at deadline");
                    self.finish_cycle(cycle_ts, started, PipelineSummary::default(), false);
                    return;
                }
            }
        } else {
            work.await
        };

        // Aggregate per index, then cycle-wide.
        let mut merged = PipelineSummary::default();
        let mut all_records: Vec<PhaseErrorRecord> = Vec::new();
        let mut shadowed: Vec<(String, &ShadowComparison)> = Vec::new();
        let mut cycle_ok = true;

        for (index, outcome) in &outcomes {
            match outcome {
                Ok(expiries) => {
                    let index_fatal = expiries.iter().any(|e| e.result.summary.fatal);
                    let index_ok = expiries.iter().all(|e| e.result.success());

                    for expiry in expiries {
                        merged.merge(&expiry.result.summary);
                        all_records.extend(expiry.state.error_records.iter().cloned());
                        if let Some(comparison) = &expiry.shadow {
                            self.apply_gating_sample(comparison.sample.clone());
                            self.check_alert_anomaly(
                                &comparison.legacy_alerts,
                                &comparison.shadow_alerts,
                            );
                            shadowed.push((index.clone(), comparison));
                        }
                    }

                    let overview = Self::aggregate_overview(&self.config, index, expiries);
                    for sink in self.sinks.iter() {
                        if let Err(e) = sink.write_overview(index, &overview) {
                            warn!(index = %index, sink = sink.name(), error = %e,
                                  "overview write failed");
                        }
                    }
                    self.state.set_overview(index, overview);

                    if index_fatal {
                        self.batcher.inc(&self.metrics.index_fatal, &[index.as_str()], 1.0);
                    }
                    if index_ok {
                        self.batcher.inc(&self.metrics.index_success, &[index.as_str()], 1.0);
                    } else {
                        self.batcher.inc(&self.metrics.index_failures, &[index.as_str()], 1.0);
                        cycle_ok = false;
                    }
                }
                Err(reason) => {
                    // Worker panic or join failure: isolate to this index.
                    cycle_ok = false;
                    self.batcher.inc(&self.metrics.index_failures, &[index.as_str()], 1.0);
                    (self.emit)(
                        StructuredEvent::new("index.failed")
                            .with_index(index.clone())
                            .with_detail(serde_json::json!({"reason": reason})),
                    );
                    self.state
                        .push_error(format!("index {index} failed: {reason}"), None);
                    error!(index = %index, reason = %reason, "index processing failed");
                }
            }
        }

        self.score_shadowed_cycle(&shadowed);

        let success = cycle_ok && merged.success();
        self.emit_panels(&merged, &all_records);
        self.finish_cycle(cycle_ts, started, merged, success);
    }

    /// Component parity score over one cycle's shadowed expiries.
    fn score_shadowed_cycle(&self, shadowed: &[(String, &ShadowComparison)]) {
        if shadowed.is_empty() {
            return;
        }

        let mut legacy = ScoreInputs::default();
        let mut shadow = ScoreInputs::default();
        let mut legacy_cov: std::collections::HashMap<String, (f64, usize)> = Default::default();
        let mut shadow_cov: std::collections::HashMap<String, (f64, usize)> = Default::default();

        for (index, cmp) in shadowed {
            legacy.option_count += cmp.legacy.persist_count;
            shadow.option_count += cmp.shadow.persist_count;
            legacy
                .alerts
                .extend(cmp.legacy_alerts.iter().map(|a| a.category.clone()));
            shadow
                .alerts
                .extend(cmp.shadow_alerts.iter().map(|a| a.category.clone()));

            let l = legacy_cov.entry(index.clone()).or_insert((0.0, 0));
            l.0 += cmp.legacy.strike_coverage;
            l.1 += 1;
            let s = shadow_cov.entry(index.clone()).or_insert((0.0, 0));
            s.0 += cmp.shadow.strike_coverage;
            s.1 += 1;
        }
        legacy.index_count = legacy_cov.len();
        shadow.index_count = shadow_cov.len();
        for (index, (sum, n)) in legacy_cov {
            legacy.strike_coverage.insert(index, sum / n as f64);
        }
        for (index, (sum, n)) in shadow_cov {
            shadow.strike_coverage.insert(index, sum / n as f64);
        }

        let score = parity_score(
            &legacy,
            &shadow,
            self.config.pipeline.parity_extended,
            self.config.pipeline.parity_weights.as_deref(),
        );
        self.metrics.shadow_parity_score.set(&[], score.score);
        debug!(
            score = score.score,
            version = score.version,
            components = ?score.components,
            "cycle parity scored"
        );
    }

    /// Dispatch one worker per index onto the bounded pool and collect all
    /// results, keeping the index attached to its outcome so a panicking
    /// worker is still attributable.
    async fn dispatch_indices(
        &self,
        ctx: &PhaseContext,
        indices: &[String],
    ) -> Vec<(String, Result<Vec<ExpiryOutcome>, String>)> {
        let pool = Arc::new(tokio::sync::Semaphore::new(
            self.config.collection.max_workers.max(1),
        ));

        let mut handles = Vec::with_capacity(indices.len());
        for index in indices {
            let worker_index = index.clone();
            let ctx = ctx.clone();
            let executor = self.executor.clone();
            let pool = pool.clone();
            let shadow = {
                let gate = self.gating.lock();
                gate.enabled() && gate.canary_applies_to(index)
            };

            let handle = tokio::spawn(async move {
                let _permit = pool.acquire_owned().await.expect("pool never closed");
                Self::run_index(&ctx, &executor, &worker_index, shadow).await
            });
            handles.push((index.clone(), handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (index, handle) in handles {
            match handle.await {
                Ok(outcomes) => results.push((index, Ok(outcomes))),
                Err(e) => {
                    let reason = if e.is_panic() { "panic" } else { "join error" };
                    results.push((index, Err(reason.to_string())));
                }
            }
        }
        results
    }

    /// Process every configured expiry rule for one index, sequentially.
    async fn run_index(
        ctx: &PhaseContext,
        executor: &PipelineExecutor,
        index: &str,
        shadow: bool,
    ) -> Vec<ExpiryOutcome> {
        let params = ctx.config.index_params.get(index).cloned().unwrap_or_default();
        let rules: Vec<ExpiryRule> = params
            .expiries
            .iter()
            .filter_map(|token| ExpiryRule::parse(token))
            .collect();

        let mut outcomes = Vec::with_capacity(rules.len());
        for rule in rules {
            let mut state = ExpiryState::new(index, rule);
            let result = executor.run(ctx, &mut state).await;

            // Shadow mode: run the parallel pipeline on a fresh state and
            // compare structural digests and alert populations.
            let comparison = if shadow {
                let mut shadow_state = ExpiryState::new(index, rule);
                let _ = executor.run(ctx, &mut shadow_state).await;
                let legacy = digest_state(&state);
                let shadow_digest = digest_state(&shadow_state);
                let sample = ParitySample::compare(&legacy, &shadow_digest);
                state.meta.insert(
                    "parity_hash".to_string(),
                    serde_json::json!(sample.parity_hash),
                );
                Some(ShadowComparison {
                    sample,
                    legacy,
                    shadow: shadow_digest,
                    legacy_alerts: alerts_of(&state),
                    shadow_alerts: alerts_of(&shadow_state),
                })
            } else {
                None
            };

            outcomes.push(ExpiryOutcome {
                rule,
                state,
                result,
                shadow: comparison,
            });
        }
        outcomes
    }

    // -------------------------------------------------------------------------
    // Aggregation
    // -------------------------------------------------------------------------

    fn aggregate_overview(
        config: &CollectorConfig,
        index: &str,
        expiries: &[ExpiryOutcome],
    ) -> OverviewSnapshot {
        let params = config.index_params.get(index).cloned().unwrap_or_default();
        let expected_rules: Vec<ExpiryRule> = params
            .expiries
            .iter()
            .filter_map(|token| ExpiryRule::parse(token))
            .collect();
        let expected_mask = expected_rules.iter().fold(0u8, |m, r| m | r.bit());

        let mut collected_mask = 0u8;
        let mut pcr = std::collections::HashMap::new();
        let mut min_ts = i64::MAX;
        let mut max_ts = i64::MIN;

        for expiry in expiries {
            if expiry.result.success() {
                collected_mask |= expiry.rule.bit();
            }
            // A bucket with zero call open interest carries no PCR.
            if let Some(ratio) = expiry.state.expiry_rec.pcr {
                pcr.insert(expiry.rule.as_str().to_string(), ratio);
            }
            for rec in expiry.state.enriched.values() {
                min_ts = min_ts.min(rec.timestamp);
                max_ts = max_ts.max(rec.timestamp);
            }
        }

        OverviewSnapshot {
            pcr,
            expiries_expected: expected_rules.len() as u32,
            expiries_collected: collected_mask.count_ones(),
            expected_mask,
            collected_mask,
            missing_mask: expected_mask & !collected_mask,
            day_width: if max_ts >= min_ts { max_ts - min_ts } else { 0 },
        }
    }

    /// Weighted alert parity anomaly check for one expiry's populations.
    fn check_alert_anomaly(&self, legacy: &[AlertSample], shadow: &[AlertSample]) {
        let threshold = self.config.pipeline.parity_alert_anomaly_threshold;
        let min_total = self.config.pipeline.parity_alert_anomaly_min_total;
        let anomaly = self
            .gating
            .lock()
            .alert_anomaly(legacy, shadow, threshold, min_total);
        if let Some(report) = anomaly {
            (self.emit)(
                StructuredEvent::new("alert_parity.anomaly").with_detail(serde_json::json!({
                    "weighted_diff": report.weighted_diff,
                    "union_size": report.union_size,
                    "diverging_categories": report.diverging_categories,
                })),
            );
        }
    }

    fn apply_gating_sample(&self, sample: ParitySample) {
        let decision = self.gating.lock().record(sample.clone());

        self.metrics
            .shadow_parity_ok_ratio
            .set(&[], decision.parity_ok_ratio);
        self.metrics
            .shadow_parity_window_size
            .set(&[], decision.window_size as f64);
        self.metrics
            .shadow_hash_churn_ratio
            .set(&[], decision.hash_churn_ratio);
        self.batcher
            .inc(&self.metrics.shadow_decisions, &[decision.reason.as_str()], 1.0);
        if decision.protected_diff {
            self.batcher
                .inc(&self.metrics.shadow_protected_diffs, &[], 1.0);
        }

        self.state.set_gating(decision);
    }

    // -------------------------------------------------------------------------
    // Cycle finish: metrics, windows, trends, panels
    // -------------------------------------------------------------------------

    fn finish_cycle(
        &self,
        cycle_ts: i64,
        started: Instant,
        merged: PipelineSummary,
        success: bool,
    ) {
        self.batcher.inc(&self.metrics.cycles_total, &[], 1.0);
        if success {
            self.batcher.inc(&self.metrics.cycles_success_total, &[], 1.0);
        }
        self.metrics
            .cycle_success
            .set(&[], if success { 1.0 } else { 0.0 });
        self.metrics.cycle_error_ratio.set(&[], merged.error_ratio());
        self.metrics
            .cycle_duration_seconds
            .observe(&[], started.elapsed().as_secs_f64());

        {
            let mut window = self.rolling.lock();
            if window.enabled() {
                window.push(success);
                self.metrics
                    .cycle_success_rate_window
                    .set(&[], window.success_rate());
                self.metrics
                    .cycle_error_rate_window
                    .set(&[], window.error_rate());
            }
        }

        // Trend file: append, then read the aggregate back into gauges.
        let summary_hash = {
            let canonical = serde_json::to_string(&merged).unwrap_or_default();
            hex::encode(Sha256::digest(canonical.as_bytes()))[..16].to_string()
        };
        if let Err(e) = self.panels.append_trend(&merged, &summary_hash) {
            warn!(error = %e, "trend append failed");
        }
        if self.config.pipeline.trends_enabled {
            match read_trends_aggregate(&self.panels.trends_path()) {
                Ok(agg) => {
                    self.metrics.trends_success_rate.set(&[], agg.success_rate);
                    self.metrics.trends_cycles.set(&[], agg.cycles as f64);
                }
                Err(e) => debug!(error = %e, "trends aggregate unavailable"),
            }
        }

        self.sync_provider_metrics();
        self.state.record_cycle(cycle_ts, success);
        // Batched counters from this cycle become visible promptly.
        self.batcher.flush();

        info!(
            success,
            phases_total = merged.phases_total,
            phases_error = merged.phases_error,
            duration_ms = started.elapsed().as_millis() as u64,
            "cycle complete"
        );
    }

    fn emit_panels(&self, merged: &PipelineSummary, records: &[PhaseErrorRecord]) {
        if !self.config.pipeline.panel_export_enabled {
            return;
        }
        let overviews = self.state.last_overviews.read().clone();
        let diagnostics = self.provider.diagnostics();
        let panels = vec![
            (
                "indices_panel".to_string(),
                serde_json::to_value(&overviews).unwrap_or_default(),
            ),
            (
                "cycle_panel".to_string(),
                serde_json::to_value(merged).unwrap_or_default(),
            ),
            (
                "provider_panel".to_string(),
                serde_json::to_value(&diagnostics).unwrap_or_default(),
            ),
        ];
        match self.panels.write_cycle(&panels) {
            Ok(names) => {
                for name in &names {
                    self.batcher.inc(&self.metrics.panel_writes, &[name.as_str()], 1.0);
                }
            }
            Err(e) => warn!(error = %e, "panel write failed"),
        }
        if let Err(e) = self.panels.write_errors_summary(merged, records) {
            warn!(error = %e, "errors summary write failed");
        }
    }

    fn write_config_snapshot(&self) {
        let p = &self.config.pipeline;
        let mut flags = BTreeMap::new();
        flags.insert("retry_enabled".to_string(), serde_json::json!(p.retry_enabled));
        flags.insert(
            "retry_max_attempts".to_string(),
            serde_json::json!(p.retry_max_attempts),
        );
        flags.insert(
            "phase_metrics_enabled".to_string(),
            serde_json::json!(p.phase_metrics_enabled),
        );
        flags.insert("rolling_window".to_string(), serde_json::json!(p.rolling_window));
        flags.insert("parity_extended".to_string(), serde_json::json!(p.parity_extended));
        flags.insert("salvage_enabled".to_string(), serde_json::json!(p.salvage_enabled));
        flags.insert("trends_enabled".to_string(), serde_json::json!(p.trends_enabled));
        flags.insert(
            "gating_mode".to_string(),
            serde_json::json!(self.config.shadow_gating.mode.to_string()),
        );
        if let Err(e) = self.panels.write_config_snapshot(&flags) {
            warn!(error = %e, "config snapshot write failed");
        }
    }

    /// Mirror the facade's cumulative counters into registry metrics using
    /// deltas, and refresh the health and cache gauges.
    fn sync_provider_metrics(&self) {
        let diag = self.provider.diagnostics();
        let mut last = self.provider_sync.lock();
        let (last_hits, last_misses, last_fb, last_qfb) = *last;

        self.metrics.provider_cache_hits.inc_by(
            &[],
            diag.cache_hits.saturating_sub(last_hits) as f64,
        );
        self.metrics.provider_cache_misses.inc_by(
            &[],
            diag.cache_misses.saturating_sub(last_misses) as f64,
        );
        self.metrics.provider_fallbacks.inc_by(
            &["fallback"],
            diag.fallback_events.saturating_sub(last_fb) as f64,
        );
        self.metrics.provider_fallbacks.inc_by(
            &["quote_fallback"],
            diag.quote_fallback_events.saturating_sub(last_qfb) as f64,
        );
        *last = (
            diag.cache_hits,
            diag.cache_misses,
            diag.fallback_events,
            diag.quote_fallback_events,
        );
        drop(last);

        self.metrics
            .provider_cache_size
            .set(&["instruments"], diag.instrument_cache_size as f64);
        self.metrics
            .provider_cache_size
            .set(&["quotes"], diag.quote_cache_size as f64);
        self.metrics
            .provider_cache_hit_ratio
            .set(&[], diag.cache_hit_ratio);
        self.metrics.provider_health.set(
            &[],
            match diag.health {
                HealthStatus::Healthy => 1.0,
                HealthStatus::Degraded(_) => 0.5,
                HealthStatus::Unhealthy(_) => 0.0,
            },
        );
    }

    // -------------------------------------------------------------------------
    // Context / summaries
    // -------------------------------------------------------------------------

    fn build_context(&self, cycle_ts: i64, cancel: watch::Receiver<bool>) -> PhaseContext {
        PhaseContext {
            config: self.config.clone(),
            provider: self.provider.clone(),
            metrics: self.metrics.clone(),
            batcher: self.batcher.clone(),
            sinks: self.sinks.clone(),
            emit: self.emit.clone(),
            provider_names: self.provider_names.clone(),
            redactors: self.redactors.clone(),
            today: chrono::Utc::now().date_naive(),
            cycle_ts,
            cancel,
        }
    }

    /// One-shot startup lines with deterministic key ordering and a
    /// truncated hash of the masked fields, plus a composite hash for drift
    /// detection across deployments.
    fn startup_summaries(&self) {
        let mut hashes = Vec::new();
        let components: Vec<(&str, BTreeMap<String, String>)> = vec![
            ("settings", self.settings_summary()),
            ("provider", self.provider_summary()),
            ("metrics", self.metrics_summary()),
            ("orchestrator", self.orchestrator_summary()),
        ];
        for (component, fields) in components {
            let joined: String = fields
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("|");
            let hash = hex::encode(Sha256::digest(joined.as_bytes()))[..8].to_string();
            info!(component, hash = %hash, summary = %joined, "startup summary");
            hashes.push(hash);
        }
        let composite =
            hex::encode(Sha256::digest(hashes.join("").as_bytes()))[..8].to_string();
        info!(hash = %composite, "startup summary composite");
    }

    fn settings_summary(&self) -> BTreeMap<String, String> {
        let c = &self.config.collection;
        let p = &self.config.pipeline;
        let mut f = BTreeMap::new();
        f.insert("interval_seconds".into(), c.interval_seconds.to_string());
        f.insert("cycle_timeout_seconds".into(), c.cycle_timeout_seconds.to_string());
        f.insert("max_workers".into(), c.max_workers.to_string());
        f.insert("retry_enabled".into(), p.retry_enabled.to_string());
        f.insert("rolling_window".into(), p.rolling_window.to_string());
        f
    }

    fn provider_summary(&self) -> BTreeMap<String, String> {
        let diag = self.provider.diagnostics();
        let pc = &self.config.provider;
        let mut f = BTreeMap::new();
        f.insert("provider".into(), diag.provider);
        f.insert("exchange".into(), pc.exchange.clone());
        f.insert("quote_cache_ttl".into(), pc.quote_cache_ttl_seconds.to_string());
        // Credentials are masked; only their presence is summarised.
        f.insert(
            "credentials".into(),
            if diag.credentials_complete { "complete" } else { "incomplete" }.to_string(),
        );
        f
    }

    fn metrics_summary(&self) -> BTreeMap<String, String> {
        let m = &self.config.metrics;
        let mut f = BTreeMap::new();
        f.insert("batch_enabled".into(), m.batch.enabled.to_string());
        f.insert("enable_groups".into(), m.enable_groups.join(","));
        f.insert("disable_groups".into(), m.disable_groups.join(","));
        f.insert("strict".into(), m.strict_exceptions.to_string());
        f
    }

    fn orchestrator_summary(&self) -> BTreeMap<String, String> {
        let mut f = BTreeMap::new();
        f.insert("indices".into(), self.config.enabled_indices().join(","));
        f.insert(
            "gating_mode".into(),
            self.config.shadow_gating.mode.to_string(),
        );
        f.insert(
            "panel_export".into(),
            self.config.pipeline.panel_export_enabled.to_string(),
        );
        f
    }
}
