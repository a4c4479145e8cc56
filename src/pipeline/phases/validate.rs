// =============================================================================
// validate — preventive checks before analytics and persistence
// =============================================================================
//
// Non-terminal findings append `validate:<issue>` tokens (with matching
// structured records) and may set `flags.validation_failed`. Only a hard
// schema mismatch aborts. Whether a fabricated expiry passes is a policy
// decision carried in settings.
// =============================================================================

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

pub struct ValidatePhase;

#[async_trait]
impl Phase for ValidatePhase {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let settings = &ctx.config.pipeline;

        // Hard schema check: every enriched key must be a fetched id.
        let ids: HashSet<&str> = state.instruments.iter().map(|i| i.id.as_str()).collect();
        if state.enriched.keys().any(|k| !ids.contains(k.as_str())) {
            return Err(PhaseError::abort("validate_schema"));
        }

        // Fabricated-expiry policy.
        if state.flags.fabricated && !settings.fabricated_passes_validate {
            return Err(PhaseError::abort("validate_fabricated"));
        }

        let mut issues: Vec<&'static str> = Vec::new();

        // Foreign expiry leakage.
        if let Some(expiry) = state.expiry_date {
            if state.instruments.iter().any(|i| i.expiry != expiry) {
                issues.push("foreign_expiry");
            }
        }

        // Minimum strike coverage fraction.
        if !state.planned_strikes.is_empty() {
            let covered: HashSet<u64> = state
                .instruments
                .iter()
                .filter(|i| state.enriched.contains_key(&i.id))
                .map(|i| i.strike.to_bits())
                .collect();
            let fraction = covered.len() as f64 / state.planned_strikes.len() as f64;
            if fraction < settings.validate_min_strike_coverage {
                issues.push("low_strike_coverage");
            }
        }

        // Required fields on enriched records.
        if state
            .enriched
            .values()
            .any(|e| e.price < 0.0 || e.timestamp <= 0)
        {
            issues.push("missing_fields");
        }

        if !issues.is_empty() {
            state.flags.validation_failed = true;
            for issue in &issues {
                state.push_phase_warning("validate", issue);
            }
            debug!(
                index = %state.index,
                rule = %state.rule,
                issues = ?issues,
                "validation findings recorded"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::test_context;
    use crate::types::{EnrichedOption, ExpiryRule, InstrumentRecord, OptionType, QuoteRecord};

    fn instrument(id: &str, strike: f64, expiry: chrono::NaiveDate) -> InstrumentRecord {
        InstrumentRecord {
            id: id.to_string(),
            symbol: format!("NIFTY{id}"),
            root: "NIFTY".to_string(),
            strike,
            option_type: OptionType::Call,
            expiry,
        }
    }

    fn quote() -> QuoteRecord {
        QuoteRecord {
            last_price: 10.0,
            bid: 9.5,
            ask: 10.5,
            volume: 100,
            open_interest: 1000,
            timestamp: 1_722_500_000,
        }
    }

    fn populated_state() -> ExpiryState {
        let expiry = chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap();
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        state.expiry_date = Some(expiry);
        state.planned_strikes = vec![22_400.0, 22_500.0];
        for (id, strike) in [("a", 22_400.0), ("b", 22_500.0)] {
            let inst = instrument(id, strike, expiry);
            state
                .enriched
                .insert(id.to_string(), EnrichedOption::from_parts(&inst, &quote()));
            state.instruments.push(inst);
        }
        state
    }

    #[tokio::test]
    async fn clean_state_passes_without_findings() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = populated_state();
        ValidatePhase.run(&ctx, &mut state).await.unwrap();
        assert!(state.errors.is_empty());
        assert!(!state.flags.validation_failed);
    }

    #[tokio::test]
    async fn foreign_expiry_recorded_as_finding() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = populated_state();
        let foreign = chrono::NaiveDate::from_ymd_opt(2024, 9, 26).unwrap();
        state.instruments.push(instrument("c", 22_400.0, foreign));

        ValidatePhase.run(&ctx, &mut state).await.unwrap();
        assert!(state.flags.validation_failed);
        assert!(state.errors.contains(&"validate:foreign_expiry".to_string()));
        assert_eq!(state.errors.len(), state.error_records.len());
    }

    #[tokio::test]
    async fn low_coverage_recorded_as_finding() {
        let (ctx, _env) = test_context(|cfg| {
            cfg.pipeline.validate_min_strike_coverage = 0.9;
        });
        let mut state = populated_state();
        state.planned_strikes = vec![22_300.0, 22_400.0, 22_500.0, 22_600.0];

        ValidatePhase.run(&ctx, &mut state).await.unwrap();
        assert!(state
            .errors
            .contains(&"validate:low_strike_coverage".to_string()));
    }

    #[tokio::test]
    async fn schema_mismatch_aborts() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = populated_state();
        let ghost = instrument("ghost", 22_400.0, state.expiry_date.unwrap());
        state
            .enriched
            .insert("ghost".to_string(), EnrichedOption::from_parts(&ghost, &quote()));
        // "ghost" never entered state.instruments.

        let err = ValidatePhase.run(&ctx, &mut state).await.unwrap_err();
        assert_eq!(err.message(), "validate_schema");
    }

    #[tokio::test]
    async fn fabricated_policy_both_paths() {
        let (ctx_pass, _env) = test_context(|_| {});
        let mut state = populated_state();
        state.flags.fabricated = true;
        ValidatePhase.run(&ctx_pass, &mut state).await.unwrap();

        let (ctx_block, _env) = test_context(|cfg| {
            cfg.pipeline.fabricated_passes_validate = false;
        });
        let mut state = populated_state();
        state.flags.fabricated = true;
        let err = ValidatePhase.run(&ctx_block, &mut state).await.unwrap_err();
        assert_eq!(err.message(), "validate_fabricated");
    }
}
