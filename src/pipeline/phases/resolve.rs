// =============================================================================
// resolve — pick the expiry date for this state's rule
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

pub struct ResolvePhase;

#[async_trait]
impl Phase for ResolvePhase {
    fn name(&self) -> &'static str {
        "resolve"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        // Replay-safe: a resolved date stays resolved.
        if state.expiry_date.is_some() {
            return Ok(());
        }

        let resolved = ctx
            .provider
            .resolve_expiries(&state.index)
            .await
            .map_err(|e| PhaseError::from_provider(e, "expiry_unresolved"))?;

        if resolved.fabricated {
            state.flags.fabricated = true;
            ctx.batcher
                .inc(&ctx.metrics.expiry_fabricated, &[state.index.as_str()], 1.0);
        }

        match resolved.select(state.rule, ctx.today) {
            Some(date) => {
                state.expiry_date = Some(date);
                debug!(
                    index = %state.index,
                    rule = %state.rule,
                    expiry = %date,
                    fabricated = state.flags.fabricated,
                    "expiry resolved"
                );
                Ok(())
            }
            None => Err(PhaseError::abort("expiry_unresolved")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{test_context, test_context_with_backend};
    use crate::provider::sim::SimBackend;
    use crate::types::ExpiryRule;

    #[tokio::test]
    async fn resolves_this_week_from_catalogue() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        ResolvePhase.run(&ctx, &mut state).await.unwrap();
        let date = state.expiry_date.unwrap();
        assert!(date >= ctx.today);
        assert!(!state.flags.fabricated);
    }

    #[tokio::test]
    async fn empty_catalogue_with_universe_fabricates() {
        let (ctx, _env) =
            test_context_with_backend(SimBackend::no_expiries(), vec![], |_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        ResolvePhase.run(&ctx, &mut state).await.unwrap();
        assert!(state.flags.fabricated);
        assert!(state.expiry_date.is_some());
    }

    #[tokio::test]
    async fn nothing_resolvable_aborts() {
        let (ctx, _env) = test_context_with_backend(SimBackend::empty(), vec![], |_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        let err = ResolvePhase.run(&ctx, &mut state).await.unwrap_err();
        assert!(matches!(err, PhaseError::Abort { .. }));
        assert_eq!(err.message(), "expiry_unresolved");
        assert!(state.expiry_date.is_none());
    }

    #[tokio::test]
    async fn replay_keeps_existing_date() {
        let (ctx, _env) = test_context_with_backend(SimBackend::empty(), vec![], |_| {});
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        let pinned = chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap();
        state.expiry_date = Some(pinned);
        ResolvePhase.run(&ctx, &mut state).await.unwrap();
        assert_eq!(state.expiry_date, Some(pinned));
    }
}
