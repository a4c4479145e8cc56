// =============================================================================
// enrich — join instruments with their quotes
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};
use crate::types::EnrichedOption;

pub struct EnrichPhase;

#[async_trait]
impl Phase for EnrichPhase {
    fn name(&self) -> &'static str {
        "enrich"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        if state.instruments.is_empty() {
            return Err(PhaseError::recoverable("enrich_empty"));
        }

        let ids = state.instrument_ids();
        let quotes = ctx
            .provider
            .get_quotes(&ids)
            .await
            .map_err(|e| PhaseError::from_provider(e, "enrich_no_quotes_domain"))?;

        for inst in &state.instruments {
            if let Some(quote) = quotes.get(&inst.id) {
                state
                    .enriched
                    .insert(inst.id.clone(), EnrichedOption::from_parts(inst, quote));
            }
        }

        if state.enriched.is_empty() {
            return Err(PhaseError::recoverable("enrich_empty"));
        }
        if state.enriched.len() < state.instruments.len() {
            state.flags.partial = true;
        }

        debug!(
            index = %state.index,
            rule = %state.rule,
            instruments = state.instruments.len(),
            enriched = state.enriched.len(),
            "quotes joined"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::phases::{fetch::FetchPhase, prefilter::PrefilterPhase, resolve::ResolvePhase};
    use crate::pipeline::test_support::{test_context, test_context_with_backend};
    use crate::provider::sim::SimBackend;
    use crate::types::ExpiryRule;
    use std::collections::HashSet;

    async fn prefiltered_state(ctx: &PhaseContext) -> ExpiryState {
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        ResolvePhase.run(ctx, &mut state).await.unwrap();
        FetchPhase.run(ctx, &mut state).await.unwrap();
        PrefilterPhase.run(ctx, &mut state).await.unwrap();
        state
    }

    #[tokio::test]
    async fn enriched_keys_are_subset_of_instrument_ids() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = prefiltered_state(&ctx).await;
        EnrichPhase.run(&ctx, &mut state).await.unwrap();

        let ids: HashSet<String> = state.instrument_ids().into_iter().collect();
        assert!(!state.enriched.is_empty());
        for key in state.enriched.keys() {
            assert!(ids.contains(key));
        }
    }

    #[tokio::test]
    async fn quote_domain_failure_is_recoverable() {
        let (ctx, _env) = test_context_with_backend(
            SimBackend::nifty_fixture().with_quote_failures(10),
            vec![],
            |cfg| {
                // Quote caching off so the scripted failure is the first
                // thing the facade sees.
                cfg.provider.quote_cache_ttl_seconds = 0.0;
            },
        );
        let mut state = prefiltered_state(&ctx).await;
        let err = EnrichPhase.run(&ctx, &mut state).await.unwrap_err();
        assert!(matches!(err, PhaseError::Recoverable { .. }));
        assert_eq!(err.message(), "enrich_no_quotes_domain");
    }
}
