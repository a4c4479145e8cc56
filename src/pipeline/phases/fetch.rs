// =============================================================================
// fetch — build the strike ladder and pull matching instruments
// =============================================================================
//
// The ladder spans ATM ± the configured ITM/OTM depth. Instruments are
// filtered to this expiry and index root (strict root equality unless
// legacy prefix matching is configured), restricted to the ladder, and
// deduplicated by id.
// =============================================================================

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

pub struct FetchPhase;

#[async_trait]
impl Phase for FetchPhase {
    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let expiry = state
            .expiry_date
            .ok_or_else(|| PhaseError::abort("expiry_missing"))?;

        // Spot and ladder plan.
        let spot = ctx
            .provider
            .get_ltp(&[state.index.clone()])
            .await
            .map_err(|e| PhaseError::from_provider(e, "no_spot"))?
            .get(&state.index)
            .copied()
            .ok_or_else(|| PhaseError::recoverable("no_spot"))?;

        state.atm_spot = spot;
        state.atm_strike = ctx.provider.get_atm_strike(&state.index, spot);
        let step = ctx.provider.strike_step(&state.index, spot);

        let params = ctx.config.index_params.get(&state.index).cloned().unwrap_or_default();
        let mut planned = Vec::with_capacity((params.strikes_itm + params.strikes_otm + 1) as usize);
        for i in (1..=params.strikes_itm).rev() {
            planned.push(state.atm_strike - step * i as f64);
        }
        planned.push(state.atm_strike);
        for i in 1..=params.strikes_otm {
            planned.push(state.atm_strike + step * i as f64);
        }
        planned.retain(|s| *s > 0.0);
        state.planned_strikes = planned;

        // Instrument universe.
        let universe = ctx
            .provider
            .get_instruments(&ctx.config.provider.exchange, false)
            .await
            .map_err(|e| PhaseError::from_provider(e, "no_instruments_domain"))?;
        if universe.is_empty() {
            return Err(PhaseError::recoverable("no_instruments_domain"));
        }

        let ladder: HashSet<u64> = state.planned_strikes.iter().map(|s| s.to_bits()).collect();
        let legacy = ctx.config.pipeline.legacy_root_matching;
        let mut seen = HashSet::new();
        let mut instruments = Vec::new();
        for inst in universe.iter() {
            let root_match = if legacy {
                inst.symbol.starts_with(&state.index)
            } else {
                inst.root == state.index
            };
            if !root_match || inst.expiry != expiry || !ladder.contains(&inst.strike.to_bits()) {
                continue;
            }
            if seen.insert(inst.id.clone()) {
                instruments.push(inst.clone());
            }
        }

        if instruments.is_empty() {
            return Err(PhaseError::recoverable("no_instruments"));
        }

        debug!(
            index = %state.index,
            rule = %state.rule,
            atm = state.atm_strike,
            planned = state.planned_strikes.len(),
            fetched = instruments.len(),
            "instruments fetched"
        );
        state.instruments = instruments;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::phases::resolve::ResolvePhase;
    use crate::pipeline::test_support::{test_context, test_context_with_backend};
    use crate::provider::sim::SimBackend;
    use crate::types::ExpiryRule;

    async fn resolved_state(ctx: &PhaseContext) -> ExpiryState {
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        ResolvePhase.run(ctx, &mut state).await.unwrap();
        state
    }

    #[tokio::test]
    async fn fetch_builds_ladder_and_dedups() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = resolved_state(&ctx).await;
        FetchPhase.run(&ctx, &mut state).await.unwrap();

        assert_eq!(state.atm_strike, 22_500.0);
        assert!(!state.instruments.is_empty());
        // No duplicate ids.
        let mut ids: Vec<&str> = state.instruments.iter().map(|i| i.id.as_str()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
        // Every instrument is on this expiry and inside the ladder.
        for inst in &state.instruments {
            assert_eq!(Some(inst.expiry), state.expiry_date);
            assert!(state.planned_strikes.contains(&inst.strike));
        }
    }

    #[tokio::test]
    async fn empty_universe_is_recoverable_domain_error() {
        let (ctx, _env) = test_context_with_backend(SimBackend::empty(), vec![], |_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        state.expiry_date = Some(chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap());
        // The sim backend has no spot either, so the earliest recoverable
        // condition surfaces; either token stops the phase recoverably.
        let err = FetchPhase.run(&ctx, &mut state).await.unwrap_err();
        assert!(matches!(err, PhaseError::Recoverable { .. }));
    }

    #[tokio::test]
    async fn wrong_root_yields_no_instruments() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = ExpiryState::new("BANKNIFTY", ExpiryRule::ThisWeek);
        // Reuse the NIFTY catalogue date but look for a root the sim
        // universe does not carry. Spot lookup also fails for it, so seed
        // the ladder path by hand.
        let mut resolved = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        ResolvePhase.run(&ctx, &mut resolved).await.unwrap();
        state.expiry_date = resolved.expiry_date;

        let err = FetchPhase.run(&ctx, &mut state).await.unwrap_err();
        assert!(matches!(err, PhaseError::Recoverable { .. }));
    }
}
