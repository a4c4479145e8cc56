// =============================================================================
// coverage — strike and field coverage written to the expiry record
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::state::CoverageRec;
use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

pub struct CoveragePhase;

#[async_trait]
impl Phase for CoveragePhase {
    fn name(&self) -> &'static str {
        "coverage"
    }

    async fn run(&self, _ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let covered: HashSet<u64> = state.enriched.values().map(|e| e.strike.to_bits()).collect();
        let planned = state.planned_strikes.len();
        let strike_coverage = if planned == 0 {
            0.0
        } else {
            let hit = state
                .planned_strikes
                .iter()
                .filter(|s| covered.contains(&s.to_bits()))
                .count();
            hit as f64 / planned as f64
        };

        let total = state.enriched.len();
        let fraction = |pred: fn(&crate::types::EnrichedOption) -> bool| -> f64 {
            if total == 0 {
                0.0
            } else {
                state.enriched.values().filter(|e| pred(e)).count() as f64 / total as f64
            }
        };

        let mut field_coverage = BTreeMap::new();
        field_coverage.insert("bid".to_string(), fraction(|e| e.bid > 0.0));
        field_coverage.insert("ask".to_string(), fraction(|e| e.ask > 0.0));
        field_coverage.insert("volume".to_string(), fraction(|e| e.volume > 0));
        field_coverage.insert(
            "open_interest".to_string(),
            fraction(|e| e.open_interest > 0),
        );
        field_coverage.insert("iv".to_string(), fraction(|e| e.iv.is_some()));

        let covered_count = state
            .planned_strikes
            .iter()
            .filter(|s| covered.contains(&s.to_bits()))
            .count();

        debug!(
            index = %state.index,
            rule = %state.rule,
            strike_coverage,
            "coverage computed"
        );

        state.expiry_rec.coverage = Some(CoverageRec {
            strike_coverage,
            planned_strikes: planned,
            covered_strikes: covered_count,
            field_coverage,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::test_context;
    use crate::types::{EnrichedOption, ExpiryRule, InstrumentRecord, OptionType, QuoteRecord};

    #[tokio::test]
    async fn coverage_fractions_computed() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        state.planned_strikes = vec![22_400.0, 22_500.0, 22_600.0, 22_700.0];

        let expiry = chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap();
        for (id, strike, volume) in [("a", 22_400.0, 100), ("b", 22_500.0, 0)] {
            let inst = InstrumentRecord {
                id: id.to_string(),
                symbol: format!("NIFTY{id}"),
                root: "NIFTY".to_string(),
                strike,
                option_type: OptionType::Call,
                expiry,
            };
            let quote = QuoteRecord {
                last_price: 10.0,
                bid: 9.0,
                ask: 11.0,
                volume,
                open_interest: 50,
                timestamp: 1,
            };
            state.instruments.push(inst.clone());
            state
                .enriched
                .insert(id.to_string(), EnrichedOption::from_parts(&inst, &quote));
        }

        CoveragePhase.run(&ctx, &mut state).await.unwrap();
        let cov = state.expiry_rec.coverage.as_ref().unwrap();
        assert!((cov.strike_coverage - 0.5).abs() < 1e-12);
        assert_eq!(cov.planned_strikes, 4);
        assert_eq!(cov.covered_strikes, 2);
        assert!((cov.field_coverage["volume"] - 0.5).abs() < 1e-12);
        assert_eq!(cov.field_coverage["iv"], 0.0);
        assert_eq!(cov.field_coverage["open_interest"], 1.0);
    }

    #[tokio::test]
    async fn empty_state_yields_zero_coverage() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        CoveragePhase.run(&ctx, &mut state).await.unwrap();
        let cov = state.expiry_rec.coverage.as_ref().unwrap();
        assert_eq!(cov.strike_coverage, 0.0);
        assert_eq!(cov.covered_strikes, 0);
    }
}
