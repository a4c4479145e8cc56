// =============================================================================
// prefilter — liquidity filters ahead of enrichment
// =============================================================================
//
// Minimum-volume, minimum-open-interest, and optional volume-percentile
// filters come from settings; all default off. Quotes needed by the filters
// are fetched through the facade's quote cache, so enrich re-reads them
// cheaply. Strikes are re-derived from survivors and must stay strictly
// ascending.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};
use crate::types::QuoteRecord;

pub struct PrefilterPhase;

impl PrefilterPhase {
    fn rederive_strikes(state: &mut ExpiryState) {
        let mut strikes: Vec<f64> = state.instruments.iter().map(|i| i.strike).collect();
        strikes.sort_by(|a, b| a.partial_cmp(b).expect("finite strikes"));
        strikes.dedup();
        state.strikes = strikes;
    }
}

#[async_trait]
impl Phase for PrefilterPhase {
    fn name(&self) -> &'static str {
        "prefilter"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let settings = &ctx.config.pipeline;
        let filters_active = settings.prefilter_min_volume > 0
            || settings.prefilter_min_open_interest > 0
            || settings.prefilter_volume_percentile.is_some();

        if !filters_active {
            Self::rederive_strikes(state);
            if state.strikes.is_empty() {
                return Err(PhaseError::recoverable("prefilter_empty"));
            }
            return Ok(());
        }

        let ids = state.instrument_ids();
        let quotes: HashMap<String, QuoteRecord> = ctx
            .provider
            .get_quotes(&ids)
            .await
            .map_err(|e| PhaseError::from_provider(e, "prefilter_empty"))?;

        // Volume percentile floor over instruments that have a quote.
        let volume_floor = settings.prefilter_volume_percentile.map(|pct| {
            let mut volumes: Vec<u64> = quotes.values().map(|q| q.volume).collect();
            volumes.sort_unstable();
            if volumes.is_empty() {
                0
            } else {
                let rank = ((pct / 100.0).clamp(0.0, 1.0) * (volumes.len() - 1) as f64) as usize;
                volumes[rank]
            }
        });

        let before = state.instruments.len();
        state.instruments.retain(|inst| {
            let Some(quote) = quotes.get(&inst.id) else {
                return false;
            };
            if quote.volume < settings.prefilter_min_volume {
                return false;
            }
            if quote.open_interest < settings.prefilter_min_open_interest {
                return false;
            }
            if let Some(floor) = volume_floor {
                if quote.volume < floor {
                    return false;
                }
            }
            true
        });

        Self::rederive_strikes(state);
        debug!(
            index = %state.index,
            rule = %state.rule,
            before,
            after = state.instruments.len(),
            strikes = state.strikes.len(),
            "prefilter applied"
        );

        if state.instruments.is_empty() {
            return Err(PhaseError::recoverable("prefilter_empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::phases::{fetch::FetchPhase, resolve::ResolvePhase};
    use crate::pipeline::test_support::test_context;
    use crate::types::ExpiryRule;

    async fn fetched_state(ctx: &PhaseContext) -> ExpiryState {
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        ResolvePhase.run(ctx, &mut state).await.unwrap();
        FetchPhase.run(ctx, &mut state).await.unwrap();
        state
    }

    #[tokio::test]
    async fn strikes_strictly_ascending_after_prefilter() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = fetched_state(&ctx).await;
        PrefilterPhase.run(&ctx, &mut state).await.unwrap();

        assert!(!state.strikes.is_empty());
        for pair in state.strikes.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[tokio::test]
    async fn min_volume_filter_eliminating_all_is_recoverable() {
        let (ctx, _env) = test_context(|cfg| {
            cfg.pipeline.prefilter_min_volume = u64::MAX;
        });
        let mut state = fetched_state(&ctx).await;
        let err = PrefilterPhase.run(&ctx, &mut state).await.unwrap_err();
        assert!(matches!(err, PhaseError::Recoverable { .. }));
        assert_eq!(err.message(), "prefilter_empty");
    }

    #[tokio::test]
    async fn oi_filter_keeps_liquid_instruments() {
        let (ctx, _env) = test_context(|cfg| {
            cfg.pipeline.prefilter_min_open_interest = 1;
        });
        let mut state = fetched_state(&ctx).await;
        let before = state.instruments.len();
        PrefilterPhase.run(&ctx, &mut state).await.unwrap();
        // The sim fixture gives every instrument open interest.
        assert_eq!(state.instruments.len(), before);
    }
}
