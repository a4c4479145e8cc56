// =============================================================================
// Pipeline Executor — ordered phases, retry policy, structured errors
// =============================================================================
//
// Drives the phase list over one ExpiryState. Only recoverable errors
// retry, and only when the retry policy is enabled; abort, fatal, and
// unknown outcomes stop the remaining phases immediately. Every failed
// sequence appends one legacy token and one structured record in lockstep.
//
// Backoff between attempt i and i+1 is `base * 2^(i-1) + uniform(0, jitter)`
// capped at 5 s, and every sleep honours the cycle's cancellation signal.
// =============================================================================

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::error::{PhaseError, PhaseOutcome};
use super::state::{truncate_provider_hints, truncate_trace, ExpiryState, PhaseErrorRecord};
use super::summary::PipelineSummary;
use super::{Phase, PhaseContext};

/// Hard cap on a single backoff sleep.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Result of one full pipeline run over an ExpiryState.
#[derive(Debug, Clone)]
pub struct PipelineRunResult {
    pub summary: PipelineSummary,
    /// (phase, final outcome) in execution order; stops at the first
    /// non-ok entry.
    pub outcomes: Vec<(&'static str, PhaseOutcome)>,
}

impl PipelineRunResult {
    pub fn success(&self) -> bool {
        self.summary.success()
    }
}

/// Outcome of one phase execution sequence (all attempts of one phase).
struct SequenceResult {
    outcome: PhaseOutcome,
    attempts: u32,
    total_duration: Duration,
    last_error: Option<PhaseError>,
}

pub struct PipelineExecutor {
    phases: Vec<std::sync::Arc<dyn Phase>>,
}

impl PipelineExecutor {
    /// The standard thirteen-phase pipeline.
    pub fn standard() -> Self {
        Self {
            phases: super::phases::standard_phases(),
        }
    }

    /// A custom phase list, used by tests and the shadow pipeline.
    pub fn with_phases(phases: Vec<std::sync::Arc<dyn Phase>>) -> Self {
        Self { phases }
    }

    /// Run all phases over `state`, stopping at the first non-ok outcome.
    pub async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> PipelineRunResult {
        let settings = &ctx.config.pipeline;
        let mut summary = PipelineSummary {
            retry_enabled: settings.retry_enabled,
            ..PipelineSummary::default()
        };
        let mut outcomes = Vec::with_capacity(self.phases.len());

        for phase in &self.phases {
            if ctx.cancelled() {
                let seq = SequenceResult {
                    outcome: PhaseOutcome::Abort,
                    attempts: 0,
                    total_duration: Duration::ZERO,
                    last_error: Some(PhaseError::abort("cancelled")),
                };
                self.finish_sequence(ctx, state, phase.name(), &seq, &mut summary, &mut outcomes);
                break;
            }

            let seq = self.run_sequence(ctx, state, phase.as_ref()).await;
            let stop = seq.outcome.stops_pipeline();
            self.finish_sequence(ctx, state, phase.name(), &seq, &mut summary, &mut outcomes);
            if stop {
                break;
            }
        }

        if let Ok(value) = serde_json::to_value(&summary) {
            state.meta.insert("pipeline_summary".to_string(), value);
        }
        self.export_structured_errors(ctx, state);

        PipelineRunResult { summary, outcomes }
    }

    /// All attempts of one phase.
    async fn run_sequence(
        &self,
        ctx: &PhaseContext,
        state: &mut ExpiryState,
        phase: &dyn Phase,
    ) -> SequenceResult {
        let settings = &ctx.config.pipeline;
        let max_attempts = if settings.retry_enabled {
            settings.retry_max_attempts.max(1)
        } else {
            1
        };
        let metrics_on = settings.phase_metrics_enabled;

        let mut total_duration = Duration::ZERO;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if metrics_on {
                ctx.batcher.inc(&ctx.metrics.phase_attempts, &[phase.name()], 1.0);
                if attempt > 1 {
                    ctx.batcher.inc(&ctx.metrics.phase_retries, &[phase.name()], 1.0);
                }
            }

            let started = Instant::now();
            let result = phase.run(ctx, state).await;
            total_duration += started.elapsed();

            match result {
                Ok(()) => {
                    return SequenceResult {
                        outcome: PhaseOutcome::Ok,
                        attempts: attempt,
                        total_duration,
                        last_error: None,
                    };
                }
                Err(err @ PhaseError::Abort { .. }) => {
                    return SequenceResult {
                        outcome: PhaseOutcome::Abort,
                        attempts: attempt,
                        total_duration,
                        last_error: Some(err),
                    };
                }
                Err(err @ PhaseError::Fatal { .. }) => {
                    return SequenceResult {
                        outcome: PhaseOutcome::Fatal,
                        attempts: attempt,
                        total_duration,
                        last_error: Some(err),
                    };
                }
                Err(err @ PhaseError::Unknown { .. }) => {
                    return SequenceResult {
                        outcome: PhaseOutcome::Unknown,
                        attempts: attempt,
                        total_duration,
                        last_error: Some(err),
                    };
                }
                Err(err @ PhaseError::Recoverable { .. }) => {
                    if attempt < max_attempts {
                        let backoff = Self::backoff_duration(
                            settings.retry_base_ms,
                            settings.retry_jitter_ms,
                            attempt,
                        );
                        if metrics_on {
                            ctx.metrics
                                .phase_retry_backoff_seconds
                                .observe(&[phase.name()], backoff.as_secs_f64());
                        }
                        warn!(
                            phase = phase.name(),
                            index = %state.index,
                            rule = %state.rule,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            "recoverable phase failure, retrying"
                        );
                        if self.sleep_cancellable(ctx, backoff).await {
                            return SequenceResult {
                                outcome: PhaseOutcome::Abort,
                                attempts: attempt,
                                total_duration,
                                last_error: Some(PhaseError::abort("cancelled")),
                            };
                        }
                        continue;
                    }

                    // Exhausted only when a real retry budget existed.
                    let outcome = if settings.retry_enabled && max_attempts > 1 {
                        PhaseOutcome::RecoverableExhausted
                    } else {
                        PhaseOutcome::Recoverable
                    };
                    return SequenceResult {
                        outcome,
                        attempts: attempt,
                        total_duration,
                        last_error: Some(err),
                    };
                }
            }
        }
    }

    /// Record final metrics, tokens, structured records, and events for one
    /// completed sequence.
    fn finish_sequence(
        &self,
        ctx: &PhaseContext,
        state: &mut ExpiryState,
        phase: &'static str,
        seq: &SequenceResult,
        summary: &mut PipelineSummary,
        outcomes: &mut Vec<(&'static str, PhaseOutcome)>,
    ) {
        let settings = &ctx.config.pipeline;
        let outcome_str = seq.outcome.as_str();

        if settings.phase_metrics_enabled {
            ctx.batcher
                .inc(&ctx.metrics.phase_outcomes, &[phase, outcome_str], 1.0);
            ctx.batcher
                .inc(&ctx.metrics.phase_runs, &[phase, outcome_str], 1.0);
            ctx.batcher.inc(
                &ctx.metrics.phase_duration_ms,
                &[phase, outcome_str],
                seq.total_duration.as_secs_f64() * 1000.0,
            );
            ctx.metrics
                .phase_duration_seconds
                .observe(&[phase, outcome_str], seq.total_duration.as_secs_f64());
            ctx.metrics
                .phase_last_attempts
                .set(&[phase], seq.attempts as f64);
        }

        summary.record(seq.outcome, seq.attempts > 1);
        outcomes.push((phase, seq.outcome));

        if seq.outcome.is_ok() {
            return;
        }

        let (message, detail) = match &seq.last_error {
            Some(err) => (err.message().to_string(), err.detail().map(str::to_string)),
            None => (outcome_str.to_string(), None),
        };

        if message == "provider_auth" {
            ctx.batcher
                .inc(&ctx.metrics.provider_auth_failures, &[], 1.0);
        }

        let token = format!("{outcome_str}:{phase}:{message}");
        let extra = self.enrichment(ctx, seq, &detail);
        let record = PhaseErrorRecord {
            phase: phase.to_string(),
            classification: outcome_str.to_string(),
            message: self.redact(ctx, &message),
            detail: detail.clone(),
            attempt: seq.attempts.max(1),
            timestamp: chrono::Utc::now().timestamp(),
            outcome_token: token,
            extra,
        };
        state.push_error(record);

        let event = crate::events::StructuredEvent::new(format!(
            "expiry.{phase}.{outcome_str}"
        ))
        .with_index(state.index.clone())
        .with_rule(state.rule.as_str());
        (ctx.emit)(event);

        match seq.outcome {
            PhaseOutcome::Abort => info!(
                phase,
                index = %state.index,
                rule = %state.rule,
                message,
                "phase aborted"
            ),
            PhaseOutcome::Fatal | PhaseOutcome::Unknown => warn!(
                phase,
                index = %state.index,
                rule = %state.rule,
                message,
                "phase failed fatally"
            ),
            _ => warn!(
                phase,
                index = %state.index,
                rule = %state.rule,
                message,
                attempts = seq.attempts,
                "phase failed"
            ),
        }
    }

    /// Provider hints for every failure; truncated trace for fatal/unknown.
    fn enrichment(
        &self,
        ctx: &PhaseContext,
        seq: &SequenceResult,
        detail: &Option<String>,
    ) -> Option<BTreeMap<String, serde_json::Value>> {
        if !ctx.config.pipeline.error_enrichment {
            return None;
        }
        let mut extra = BTreeMap::new();
        if !ctx.provider_names.is_empty() {
            extra.insert(
                "providers".to_string(),
                serde_json::json!(truncate_provider_hints(&ctx.provider_names)),
            );
        }
        if matches!(seq.outcome, PhaseOutcome::Fatal | PhaseOutcome::Unknown) {
            if let Some(detail) = detail {
                extra.insert(
                    "trace".to_string(),
                    serde_json::Value::String(truncate_trace(detail)),
                );
            }
        }
        (!extra.is_empty()).then_some(extra)
    }

    fn redact(&self, ctx: &PhaseContext, message: &str) -> String {
        let mut out = message.to_string();
        for pattern in ctx.redactors.iter() {
            out = pattern
                .replace_all(&out, ctx.config.pipeline.redact_replacement.as_str())
                .into_owned();
        }
        out
    }

    /// Write `meta["structured_errors"]` and optionally the stdout line.
    fn export_structured_errors(&self, ctx: &PhaseContext, state: &mut ExpiryState) {
        if state.error_records.is_empty() {
            return;
        }
        let records: Vec<serde_json::Value> = state
            .error_records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "phase": r.phase,
                    "classification": r.classification,
                    "message": r.message,
                    "attempt": r.attempt,
                    "ts": r.timestamp,
                })
            })
            .collect();

        let canonical = serde_json::to_string(&records).unwrap_or_default();
        let hash = hex::encode(Sha256::digest(canonical.as_bytes()))[..16].to_string();

        let export = serde_json::json!({
            "count": records.len(),
            "records": records,
            "exported_at": chrono::Utc::now().timestamp(),
            "hash": hash,
        });

        if ctx.config.pipeline.structured_errors_stdout {
            // Operator contract: single line, sorted keys.
            println!("pipeline.structured_errors {export}");
        }
        state.meta.insert("structured_errors".to_string(), export);
    }

    fn backoff_duration(base_ms: u64, jitter_ms: u64, attempt: u32) -> Duration {
        let exp = base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter)).min(BACKOFF_CAP)
    }

    /// Returns true when cancellation fired during the sleep.
    async fn sleep_cancellable(&self, ctx: &PhaseContext, duration: Duration) -> bool {
        let mut cancel = ctx.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = cancel.changed() => changed.is_ok() && *cancel.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{test_context, FailPlan, ScriptedPhase};
    use crate::types::ExpiryRule;
    use std::sync::Arc;

    fn state() -> ExpiryState {
        ExpiryState::new("NIFTY", ExpiryRule::ThisWeek)
    }

    #[tokio::test]
    async fn all_ok_runs_every_phase() {
        let (ctx, _env) = test_context(|_| {});
        let exec = PipelineExecutor::with_phases(vec![
            Arc::new(ScriptedPhase::ok("alpha")),
            Arc::new(ScriptedPhase::ok("beta")),
        ]);
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert!(result.success());
        assert_eq!(result.summary.phases_total, 2);
        assert_eq!(result.summary.phases_ok, 2);
        assert!(st.errors.is_empty());
        assert!(st.meta.contains_key("pipeline_summary"));
    }

    #[tokio::test]
    async fn abort_stops_remaining_phases() {
        let (ctx, _env) = test_context(|_| {});
        let exec = PipelineExecutor::with_phases(vec![
            Arc::new(ScriptedPhase::failing(
                "resolve",
                FailPlan::Always(PhaseError::abort("expiry_unresolved")),
            )),
            Arc::new(ScriptedPhase::ok("fetch")),
        ]);
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert_eq!(result.summary.phases_total, 1);
        assert_eq!(result.summary.phases_error, 1);
        assert!(result.summary.aborted_early);
        assert_eq!(st.errors, vec!["abort:resolve:expiry_unresolved"]);
        assert_eq!(st.error_records.len(), 1);
        assert_eq!(st.error_records[0].outcome_token, st.errors[0]);
    }

    #[tokio::test]
    async fn recoverable_without_retry_stops() {
        let (ctx, _env) = test_context(|_| {});
        let exec = PipelineExecutor::with_phases(vec![Arc::new(ScriptedPhase::failing(
            "fetch",
            FailPlan::Always(PhaseError::recoverable("no_instruments_domain")),
        ))]);
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert_eq!(result.outcomes[0].1, PhaseOutcome::Recoverable);
        assert_eq!(st.errors, vec!["recoverable:fetch:no_instruments_domain"]);
    }

    #[tokio::test]
    async fn retry_to_success_leaves_no_tokens() {
        let (ctx, env) = test_context(|cfg| {
            cfg.pipeline.retry_enabled = true;
            cfg.pipeline.retry_max_attempts = 3;
            cfg.pipeline.retry_base_ms = 10;
            cfg.pipeline.retry_jitter_ms = 0;
        });
        let exec = PipelineExecutor::with_phases(vec![Arc::new(ScriptedPhase::failing(
            "fetch",
            FailPlan::FailFirst(1),
        ))]);
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert!(result.success());
        assert!(st.errors.is_empty());
        assert_eq!(env.metrics.phase_attempts.get(&["fetch"]), 2.0);
        assert_eq!(env.metrics.phase_retries.get(&["fetch"]), 1.0);
        assert_eq!(env.metrics.phase_outcomes.get(&["fetch", "ok"]), 1.0);
        // One backoff observation around 10 ms.
        assert_eq!(env.metrics.phase_retry_backoff_seconds.count(&["fetch"]), 1);
        let sum = env.metrics.phase_retry_backoff_seconds.sum(&["fetch"]);
        assert!((0.010..0.015).contains(&sum), "backoff sum {sum}");
    }

    #[tokio::test]
    async fn retry_exhaustion_records_single_token() {
        let (ctx, env) = test_context(|cfg| {
            cfg.pipeline.retry_enabled = true;
            cfg.pipeline.retry_max_attempts = 2;
            cfg.pipeline.retry_base_ms = 1;
        });
        let exec = PipelineExecutor::with_phases(vec![Arc::new(ScriptedPhase::failing(
            "fetch",
            FailPlan::Always(PhaseError::recoverable("no_instruments_domain")),
        ))]);
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert_eq!(result.outcomes[0].1, PhaseOutcome::RecoverableExhausted);
        assert_eq!(
            st.errors,
            vec!["recoverable_exhausted:fetch:no_instruments_domain"]
        );
        assert_eq!(st.error_records[0].attempt, 2);
        assert_eq!(env.metrics.phase_attempts.get(&["fetch"]), 2.0);
        assert!(result.summary.recoverable_exhausted);
        assert!((result.summary.error_ratio() - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn max_attempts_one_is_equivalent_to_disabled() {
        let (ctx, _env) = test_context(|cfg| {
            cfg.pipeline.retry_enabled = true;
            cfg.pipeline.retry_max_attempts = 1;
        });
        let exec = PipelineExecutor::with_phases(vec![Arc::new(ScriptedPhase::failing(
            "fetch",
            FailPlan::Always(PhaseError::recoverable("no_instruments_domain")),
        ))]);
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;
        assert_eq!(result.outcomes[0].1, PhaseOutcome::Recoverable);
    }

    #[tokio::test]
    async fn abort_and_fatal_never_retry() {
        let (ctx, env) = test_context(|cfg| {
            cfg.pipeline.retry_enabled = true;
            cfg.pipeline.retry_max_attempts = 5;
        });
        let exec = PipelineExecutor::with_phases(vec![Arc::new(ScriptedPhase::failing(
            "persist",
            FailPlan::Always(PhaseError::fatal("sink_write")),
        ))]);
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert_eq!(result.outcomes[0].1, PhaseOutcome::Fatal);
        assert_eq!(env.metrics.phase_attempts.get(&["persist"]), 1.0);
        assert!(result.summary.fatal);
    }

    #[tokio::test]
    async fn unknown_is_fatal_for_control_flow() {
        let (ctx, _env) = test_context(|_| {});
        let exec = PipelineExecutor::with_phases(vec![
            Arc::new(ScriptedPhase::failing(
                "snapshot",
                FailPlan::Always(PhaseError::unknown("boom", Some("trace line".into()))),
            )),
            Arc::new(ScriptedPhase::ok("summarize")),
        ]);
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert_eq!(result.summary.phases_total, 1);
        assert!(result.summary.fatal);
        assert_eq!(st.errors, vec!["unknown:snapshot:boom"]);
        let extra = st.error_records[0].extra.as_ref().unwrap();
        assert!(extra.contains_key("trace"));
    }

    #[tokio::test]
    async fn redaction_touches_record_message_not_token() {
        let (ctx, _env) = test_context(|cfg| {
            cfg.pipeline.redact_patterns = vec!["secret-\\d+".to_string()];
        });
        let exec = PipelineExecutor::with_phases(vec![Arc::new(ScriptedPhase::failing(
            "persist",
            FailPlan::Always(PhaseError::fatal("secret-123")),
        ))]);
        let mut st = state();
        exec.run(&ctx, &mut st).await;

        assert_eq!(st.errors, vec!["fatal:persist:secret-123"]);
        assert_eq!(st.error_records[0].message, "[redacted]");
    }

    #[tokio::test]
    async fn structured_errors_exported_with_hash() {
        let (ctx, _env) = test_context(|_| {});
        let exec = PipelineExecutor::with_phases(vec![Arc::new(ScriptedPhase::failing(
            "fetch",
            FailPlan::Always(PhaseError::recoverable("no_instruments_domain")),
        ))]);
        let mut st = state();
        exec.run(&ctx, &mut st).await;

        let export = st.meta.get("structured_errors").unwrap();
        assert_eq!(export["count"], 1);
        assert_eq!(export["hash"].as_str().unwrap().len(), 16);
        assert_eq!(export["records"][0]["phase"], "fetch");
    }

    #[tokio::test]
    async fn standard_pipeline_happy_path() {
        let (ctx, env) = test_context(|cfg| {
            cfg.greeks.enabled = true;
            cfg.greeks.estimate_iv = true;
            // The sim chain spans five strikes around ATM; plan exactly
            // those so validate sees full coverage.
            let params = cfg.index_params.get_mut("NIFTY").unwrap();
            params.strikes_itm = 2;
            params.strikes_otm = 2;
        });
        let exec = PipelineExecutor::standard();
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert!(result.success(), "errors: {:?}", st.errors);
        assert_eq!(result.summary.phases_total, 13);
        assert_eq!(result.summary.phases_ok, 13);
        assert!(!result.summary.aborted_early);
        assert!(st.errors.is_empty());
        assert!(st.flags.persisted);
        assert!(st.expiry_date.is_some());
        assert!(!st.strikes.is_empty());
        assert!(!st.enriched.is_empty());
        // Greeks attached to every enriched record (fallback IV at worst).
        assert!(st.enriched.values().all(|e| e.greeks.is_some()));
        // Rows reached the sink and the completion event fired.
        assert!(env.mem_sink.row_count() > 0);
        assert!(env
            .events
            .lock()
            .iter()
            .any(|e| e.kind == "expiry.complete"));
        // Snapshot present and versioned.
        assert_eq!(st.expiry_rec.snapshot.as_ref().unwrap()["version"], 1);
    }

    #[tokio::test]
    async fn standard_pipeline_aborts_cleanly_on_empty_world() {
        use crate::pipeline::test_support::test_context_with_backend;
        use crate::provider::sim::SimBackend;

        let (ctx, _env) = test_context_with_backend(SimBackend::empty(), vec![], |_| {});
        let exec = PipelineExecutor::standard();
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert_eq!(result.summary.phases_total, 1);
        assert_eq!(result.summary.phases_error, 1);
        assert!(result.summary.aborted_early);
        assert_eq!(st.errors, vec!["abort:resolve:expiry_unresolved"]);
    }

    #[tokio::test]
    async fn cancellation_maps_to_abort() {
        let (ctx, env) = test_context(|_| {});
        env.cancel_tx.send(true).unwrap();
        let exec = PipelineExecutor::with_phases(vec![Arc::new(ScriptedPhase::ok("resolve"))]);
        let mut st = state();
        let result = exec.run(&ctx, &mut st).await;

        assert_eq!(result.outcomes[0].1, PhaseOutcome::Abort);
        assert_eq!(st.errors, vec!["abort:resolve:cancelled"]);
    }
}
