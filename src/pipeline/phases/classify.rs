// =============================================================================
// classify — liquidity regime tag from coverage and volume statistics
// =============================================================================
//
// Buckets (evaluated top-to-bottom; first match wins):
//
//   LIQUID    — strike coverage >= 0.8 AND total volume >= 10_000
//   BALANCED  — strike coverage >= 0.5
//   THIN      — anything with at least one enriched record
//
// Pure function of the state; no provider calls.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

const LIQUID_COVERAGE: f64 = 0.8;
const LIQUID_VOLUME: u64 = 10_000;
const BALANCED_COVERAGE: f64 = 0.5;

pub struct ClassifyPhase;

#[async_trait]
impl Phase for ClassifyPhase {
    fn name(&self) -> &'static str {
        "classify"
    }

    async fn run(&self, _ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let Some(coverage) = state.expiry_rec.coverage.as_ref() else {
            return Err(PhaseError::recoverable("classify_unmatched"));
        };
        if state.enriched.is_empty() {
            return Err(PhaseError::recoverable("classify_unmatched"));
        }

        let total_volume: u64 = state.enriched.values().map(|e| e.volume).sum();
        let tag = if coverage.strike_coverage >= LIQUID_COVERAGE && total_volume >= LIQUID_VOLUME {
            "liquid"
        } else if coverage.strike_coverage >= BALANCED_COVERAGE {
            "balanced"
        } else {
            "thin"
        };

        debug!(
            index = %state.index,
            rule = %state.rule,
            tag,
            total_volume,
            "expiry classified"
        );
        state.expiry_rec.classification = Some(tag.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::CoverageRec;
    use crate::pipeline::test_support::test_context;
    use crate::types::{EnrichedOption, ExpiryRule, InstrumentRecord, OptionType, QuoteRecord};

    fn state_with(coverage: f64, volume: u64) -> ExpiryState {
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        state.expiry_rec.coverage = Some(CoverageRec {
            strike_coverage: coverage,
            planned_strikes: 10,
            covered_strikes: (coverage * 10.0) as usize,
            field_coverage: Default::default(),
        });
        let inst = InstrumentRecord {
            id: "a".to_string(),
            symbol: "NIFTYa".to_string(),
            root: "NIFTY".to_string(),
            strike: 22_500.0,
            option_type: OptionType::Call,
            expiry: chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap(),
        };
        let quote = QuoteRecord {
            last_price: 10.0,
            bid: 9.0,
            ask: 11.0,
            volume,
            open_interest: 100,
            timestamp: 1,
        };
        state
            .enriched
            .insert("a".to_string(), EnrichedOption::from_parts(&inst, &quote));
        state
    }

    #[tokio::test]
    async fn buckets_assigned_by_coverage_and_volume() {
        let (ctx, _env) = test_context(|_| {});

        let mut liquid = state_with(0.9, 50_000);
        ClassifyPhase.run(&ctx, &mut liquid).await.unwrap();
        assert_eq!(liquid.expiry_rec.classification.as_deref(), Some("liquid"));

        let mut balanced = state_with(0.6, 100);
        ClassifyPhase.run(&ctx, &mut balanced).await.unwrap();
        assert_eq!(balanced.expiry_rec.classification.as_deref(), Some("balanced"));

        let mut thin = state_with(0.2, 100);
        ClassifyPhase.run(&ctx, &mut thin).await.unwrap();
        assert_eq!(thin.expiry_rec.classification.as_deref(), Some("thin"));
    }

    #[tokio::test]
    async fn missing_coverage_is_unmatched() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        let err = ClassifyPhase.run(&ctx, &mut state).await.unwrap_err();
        assert_eq!(err.message(), "classify_unmatched");
    }
}
