// =============================================================================
// ExpiryState — the unit of work flowing through the pipeline
// =============================================================================
//
// Created by the orchestrator at the start of an expiry's processing,
// mutated only by the currently executing phase, discarded after summarize.
// Never shared concurrently with another worker.
//
// The record type is closed; anything open-ended goes through the `meta`
// map as tagged JSON values. Legacy error tokens and structured error
// records are appended in lockstep: every token has a record whose
// `outcome_token` matches it exactly.
// =============================================================================

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::types::{EnrichedOption, ExpiryRule, InstrumentRecord};

// =============================================================================
// Structured error record
// =============================================================================

/// Cap on provider names carried in `extra`.
pub const ERROR_PROVIDER_HINT_MAX: usize = 10;
/// Cap on each provider name's length in `extra`.
pub const ERROR_PROVIDER_NAME_MAX: usize = 40;
/// Cap on the truncated trace carried for fatal/unknown records.
pub const ERROR_TRACE_MAX: usize = 800;

/// One structured record per legacy error token.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseErrorRecord {
    pub phase: String,
    /// Final outcome classification: abort, recoverable,
    /// recoverable_exhausted, fatal, unknown, or a phase-specific prefix.
    pub classification: String,
    /// Stable short code.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// 1-based attempt on which the final failure occurred.
    pub attempt: u32,
    /// Epoch seconds.
    pub timestamp: i64,
    /// Exact string appended to `ExpiryState::errors`.
    pub outcome_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<BTreeMap<String, serde_json::Value>>,
}

// =============================================================================
// Expiry record substructures
// =============================================================================

/// Coverage written by the coverage phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverageRec {
    /// Covered strikes / planned strikes.
    pub strike_coverage: f64,
    pub planned_strikes: usize,
    pub covered_strikes: usize,
    /// Fraction of enriched records carrying each optional field.
    pub field_coverage: BTreeMap<String, f64>,
}

/// Cumulative per-expiry output record. Phases only append or annotate here;
/// nothing recorded is ever removed by a later phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpiryRec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageRec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
    /// Options persisted by the persist phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_count: Option<usize>,
    /// Put/call open-interest ratio for this expiry, when computable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcr: Option<f64>,
}

/// Transient boolean markers.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StateFlags {
    pub fabricated: bool,
    pub salvaged: bool,
    pub persisted: bool,
    pub validation_failed: bool,
    pub partial: bool,
}

// =============================================================================
// ExpiryState
// =============================================================================

#[derive(Debug, Clone)]
pub struct ExpiryState {
    /// Uppercase index symbol, e.g. "NIFTY".
    pub index: String,
    pub rule: ExpiryRule,
    /// Set by resolve. Null only when resolve aborted without fabrication.
    pub expiry_date: Option<NaiveDate>,

    /// Index spot observed at fetch time.
    pub atm_spot: f64,
    pub atm_strike: f64,
    /// The strike ladder planned around ATM.
    pub planned_strikes: Vec<f64>,
    /// Strikes surviving prefilter; strictly ascending, no duplicates.
    pub strikes: Vec<f64>,

    /// Instruments after fetch; deduplicated by id.
    pub instruments: Vec<InstrumentRecord>,
    /// Keyed by instrument id; always a subset of `instruments` ids.
    pub enriched: BTreeMap<String, EnrichedOption>,

    pub expiry_rec: ExpiryRec,

    /// Legacy tokens, `<classification>:<phase>[:<detail>]`.
    pub errors: Vec<String>,
    /// One structured record per token, same order.
    pub error_records: Vec<PhaseErrorRecord>,

    pub flags: StateFlags,
    /// Open-ended annotations: gating decision, pipeline summary, parity
    /// hash, export snapshots.
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl ExpiryState {
    pub fn new(index: impl Into<String>, rule: ExpiryRule) -> Self {
        Self {
            index: index.into(),
            rule,
            expiry_date: None,
            atm_spot: 0.0,
            atm_strike: 0.0,
            planned_strikes: Vec::new(),
            strikes: Vec::new(),
            instruments: Vec::new(),
            enriched: BTreeMap::new(),
            expiry_rec: ExpiryRec::default(),
            errors: Vec::new(),
            error_records: Vec::new(),
            flags: StateFlags::default(),
            meta: BTreeMap::new(),
        }
    }

    /// Append a legacy token and its structured record in lockstep.
    pub fn push_error(&mut self, record: PhaseErrorRecord) {
        self.errors.push(record.outcome_token.clone());
        self.error_records.push(record);
    }

    /// Append a phase-issued warning token (`<phase>:<issue>`) with its
    /// record. Used by validate for non-terminal findings.
    pub fn push_phase_warning(&mut self, phase: &str, issue: &str) {
        let token = format!("{phase}:{issue}");
        self.push_error(PhaseErrorRecord {
            phase: phase.to_string(),
            classification: phase.to_string(),
            message: issue.to_string(),
            detail: None,
            attempt: 1,
            timestamp: chrono::Utc::now().timestamp(),
            outcome_token: token,
            extra: None,
        });
    }

    /// Ids of all fetched instruments, for subset checks.
    pub fn instrument_ids(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.id.clone()).collect()
    }

    /// Total call and put open interest over enriched records.
    pub fn oi_totals(&self) -> (u64, u64) {
        let mut call_oi = 0u64;
        let mut put_oi = 0u64;
        for rec in self.enriched.values() {
            match rec.option_type {
                crate::types::OptionType::Call => call_oi += rec.open_interest,
                crate::types::OptionType::Put => put_oi += rec.open_interest,
            }
        }
        (call_oi, put_oi)
    }
}

/// Truncate a trace string to the export cap.
pub fn truncate_trace(trace: &str) -> String {
    if trace.len() <= ERROR_TRACE_MAX {
        trace.to_string()
    } else {
        trace.chars().take(ERROR_TRACE_MAX).collect()
    }
}

/// Truncate provider hints to the export caps.
pub fn truncate_provider_hints(names: &[String]) -> Vec<String> {
    names
        .iter()
        .take(ERROR_PROVIDER_HINT_MAX)
        .map(|n| n.chars().take(ERROR_PROVIDER_NAME_MAX).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OptionType, QuoteRecord};

    #[test]
    fn errors_and_records_stay_in_lockstep() {
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        state.push_error(PhaseErrorRecord {
            phase: "resolve".into(),
            classification: "abort".into(),
            message: "expiry_unresolved".into(),
            detail: None,
            attempt: 1,
            timestamp: 0,
            outcome_token: "abort:resolve:expiry_unresolved".into(),
            extra: None,
        });
        state.push_phase_warning("validate", "low_strike_coverage");

        assert_eq!(state.errors.len(), state.error_records.len());
        for (token, record) in state.errors.iter().zip(&state.error_records) {
            assert_eq!(token, &record.outcome_token);
        }
        assert_eq!(state.errors[1], "validate:low_strike_coverage");
    }

    #[test]
    fn oi_totals_split_by_side() {
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        let quote = QuoteRecord {
            last_price: 10.0,
            bid: 9.0,
            ask: 11.0,
            volume: 1,
            open_interest: 100,
            timestamp: 0,
        };
        for (i, side) in [(0, OptionType::Call), (1, OptionType::Put), (2, OptionType::Put)] {
            let inst = InstrumentRecord {
                id: format!("i{i}"),
                symbol: format!("NIFTY{i}"),
                root: "NIFTY".into(),
                strike: 22_500.0,
                option_type: side,
                expiry: chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap(),
            };
            state
                .enriched
                .insert(inst.id.clone(), EnrichedOption::from_parts(&inst, &quote));
        }
        assert_eq!(state.oi_totals(), (100, 200));
    }

    #[test]
    fn trace_truncation_caps_length() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_trace(&long).len(), ERROR_TRACE_MAX);
        let hints: Vec<String> = (0..20).map(|i| format!("provider-{i}")).collect();
        assert_eq!(truncate_provider_hints(&hints).len(), ERROR_PROVIDER_HINT_MAX);
    }
}
