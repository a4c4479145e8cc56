// =============================================================================
// greeks — Black-Scholes sensitivities for enriched records
// =============================================================================
//
// Uses the solved or provided IV, falling back to the configured constant
// when neither exists. Per-instrument math failures are tolerated and
// counted; they never fail the phase.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::analytics::bs_greeks;
use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

pub struct GreeksPhase;

#[async_trait]
impl Phase for GreeksPhase {
    fn name(&self) -> &'static str {
        "greeks"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let greeks_cfg = &ctx.config.greeks;
        if !greeks_cfg.enabled {
            return Ok(());
        }
        let Some(expiry) = state.expiry_date else {
            return Ok(());
        };

        let days = (expiry - ctx.today).num_days() as f64;
        let t_years = days.max(0.25) / 365.0;
        let spot = state.atm_spot;

        let mut computed = 0u64;
        let mut failures = 0u64;

        for rec in state.enriched.values_mut() {
            if rec.greeks.is_some() {
                continue;
            }
            let vol = rec
                .iv
                .filter(|v| *v > 0.0)
                .unwrap_or(greeks_cfg.fallback_iv);
            match bs_greeks(
                rec.option_type,
                spot,
                rec.strike,
                t_years,
                greeks_cfg.risk_free_rate,
                vol,
            ) {
                Some(greeks) => {
                    rec.greeks = Some(greeks);
                    computed += 1;
                }
                None => failures += 1,
            }
        }

        if computed > 0 {
            ctx.batcher
                .inc(&ctx.metrics.greeks_computed, &[state.index.as_str()], computed as f64);
        }
        if failures > 0 {
            ctx.batcher.inc(
                &ctx.metrics.greeks_math_failures,
                &[state.index.as_str()],
                failures as f64,
            );
        }

        debug!(
            index = %state.index,
            rule = %state.rule,
            computed,
            failures,
            "greeks computed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::test_context;
    use crate::types::{EnrichedOption, ExpiryRule, InstrumentRecord, OptionType, QuoteRecord};

    fn state_with_options(today: chrono::NaiveDate) -> ExpiryState {
        let expiry = today + chrono::Duration::days(7);
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        state.expiry_date = Some(expiry);
        state.atm_spot = 22_500.0;
        for (id, side) in [("c", OptionType::Call), ("p", OptionType::Put)] {
            let inst = InstrumentRecord {
                id: id.to_string(),
                symbol: format!("NIFTY{id}"),
                root: "NIFTY".to_string(),
                strike: 22_500.0,
                option_type: side,
                expiry,
            };
            let quote = QuoteRecord {
                last_price: 100.0,
                bid: 99.0,
                ask: 101.0,
                volume: 10,
                open_interest: 100,
                timestamp: 1,
            };
            state
                .enriched
                .insert(id.to_string(), EnrichedOption::from_parts(&inst, &quote));
            state.instruments.push(inst);
        }
        state
    }

    #[tokio::test]
    async fn fallback_iv_used_when_no_iv_present() {
        let (ctx, env) = test_context(|cfg| {
            cfg.greeks.enabled = true;
        });
        let mut state = state_with_options(ctx.today);
        GreeksPhase.run(&ctx, &mut state).await.unwrap();

        let call = state.enriched["c"].greeks.unwrap();
        let put = state.enriched["p"].greeks.unwrap();
        assert!(call.delta > 0.0 && put.delta < 0.0);
        assert_eq!(env.metrics.greeks_computed.get(&["NIFTY"]), 2.0);
    }

    #[tokio::test]
    async fn math_failure_tolerated_and_counted() {
        let (ctx, env) = test_context(|cfg| {
            cfg.greeks.enabled = true;
        });
        let mut state = state_with_options(ctx.today);
        // A non-positive spot breaks the model for every record.
        state.atm_spot = 0.0;
        GreeksPhase.run(&ctx, &mut state).await.unwrap();

        assert!(state.enriched.values().all(|e| e.greeks.is_none()));
        assert_eq!(env.metrics.greeks_math_failures.get(&["NIFTY"]), 2.0);
    }

    #[tokio::test]
    async fn disabled_greeks_is_a_no_op() {
        let (ctx, _env) = test_context(|_| {});
        let mut state = state_with_options(ctx.today);
        GreeksPhase.run(&ctx, &mut state).await.unwrap();
        assert!(state.enriched.values().all(|e| e.greeks.is_none()));
    }
}
