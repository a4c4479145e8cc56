// =============================================================================
// snapshot — outward-facing per-expiry snapshot (schema v1)
// =============================================================================

use async_trait::async_trait;

use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

/// Snapshot schema version. Bump only with additive changes.
const SNAPSHOT_VERSION: u32 = 1;

pub struct SnapshotPhase;

#[async_trait]
impl Phase for SnapshotPhase {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let (call_oi, put_oi) = state.oi_totals();
        let pcr = (call_oi > 0).then(|| put_oi as f64 / call_oi as f64);
        state.expiry_rec.pcr = pcr;

        let coverage = match serde_json::to_value(&state.expiry_rec.coverage) {
            Ok(v) => v,
            Err(e) => {
                return Err(PhaseError::recoverable_with(
                    "snapshot_serialize",
                    e.to_string(),
                ))
            }
        };

        let snapshot = serde_json::json!({
            "version": SNAPSHOT_VERSION,
            "index": state.index,
            "rule": state.rule.as_str(),
            "expiry_date": state.expiry_date.map(|d| d.to_string()),
            "atm_strike": state.atm_strike,
            "strike_count": state.strikes.len(),
            "instrument_count": state.instruments.len(),
            "option_count": state.enriched.len(),
            "pcr": pcr,
            "classification": state.expiry_rec.classification,
            "coverage": coverage,
            "fabricated": state.flags.fabricated,
            "salvaged": state.flags.salvaged,
            "generated_at": ctx.cycle_ts,
        });

        state.expiry_rec.snapshot = Some(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::test_context;
    use crate::types::{EnrichedOption, ExpiryRule, InstrumentRecord, OptionType, QuoteRecord};

    #[tokio::test]
    async fn snapshot_is_versioned_and_carries_counts() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        state.expiry_date = Some(chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap());
        state.strikes = vec![22_400.0, 22_500.0];

        for (id, side, oi) in [("c", OptionType::Call, 100), ("p", OptionType::Put, 80)] {
            let inst = InstrumentRecord {
                id: id.to_string(),
                symbol: format!("NIFTY{id}"),
                root: "NIFTY".to_string(),
                strike: 22_500.0,
                option_type: side,
                expiry: state.expiry_date.unwrap(),
            };
            let quote = QuoteRecord {
                last_price: 10.0,
                bid: 9.0,
                ask: 11.0,
                volume: 1,
                open_interest: oi,
                timestamp: 1,
            };
            state
                .enriched
                .insert(id.to_string(), EnrichedOption::from_parts(&inst, &quote));
            state.instruments.push(inst);
        }

        SnapshotPhase.run(&ctx, &mut state).await.unwrap();
        let snap = state.expiry_rec.snapshot.as_ref().unwrap();
        assert_eq!(snap["version"], 1);
        assert_eq!(snap["option_count"], 2);
        assert_eq!(snap["strike_count"], 2);
        assert!((snap["pcr"].as_f64().unwrap() - 0.8).abs() < 1e-12);
    }

    #[tokio::test]
    async fn zero_call_oi_omits_pcr() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        state.expiry_date = Some(chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap());
        SnapshotPhase.run(&ctx, &mut state).await.unwrap();
        assert!(state.expiry_rec.pcr.is_none());
        assert!(state.expiry_rec.snapshot.as_ref().unwrap()["pcr"].is_null());
    }
}
