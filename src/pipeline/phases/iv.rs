// =============================================================================
// iv — Newton-Raphson implied volatility for enriched records
// =============================================================================
//
// Runs only when IV estimation is enabled, and only for records that do not
// already carry a positive implied volatility. Divergence or bound breach
// leaves the record's IV unset and is counted; the phase itself never fails
// on solver outcomes.
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use crate::analytics::implied_vol;
use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

pub struct IvPhase;

#[async_trait]
impl Phase for IvPhase {
    fn name(&self) -> &'static str {
        "iv"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let greeks_cfg = &ctx.config.greeks;
        if !greeks_cfg.estimate_iv {
            return Ok(());
        }
        let Some(expiry) = state.expiry_date else {
            return Ok(());
        };

        // Actual/365 day count, floored at a quarter day on expiry day.
        let days = (expiry - ctx.today).num_days() as f64;
        let t_years = days.max(0.25) / 365.0;
        let spot = state.atm_spot;
        let expiry_label = expiry.to_string();

        let mut solved = 0u64;
        let mut failed = 0u64;
        let mut iterations_total = 0u64;

        for rec in state.enriched.values_mut() {
            if rec.iv.map(|v| v > 0.0).unwrap_or(false) {
                continue;
            }
            let target = rec.mid_or_last();
            match implied_vol(
                rec.option_type,
                spot,
                rec.strike,
                t_years,
                greeks_cfg.risk_free_rate,
                target,
                greeks_cfg.iv_min,
                greeks_cfg.iv_max,
                greeks_cfg.iv_max_iterations,
                greeks_cfg.iv_precision,
            ) {
                Ok(solution) => {
                    rec.iv = Some(solution.iv);
                    solved += 1;
                    iterations_total += solution.iterations as u64;
                }
                Err(_) => failed += 1,
            }
        }

        if solved > 0 {
            ctx.batcher.inc(
                &ctx.metrics.iv_success,
                &[state.index.as_str(), expiry_label.as_str()],
                solved as f64,
            );
            ctx.metrics.iv_avg_iterations.set(
                &[state.index.as_str()],
                iterations_total as f64 / solved as f64,
            );
        }
        if failed > 0 {
            ctx.batcher.inc(
                &ctx.metrics.iv_failure,
                &[state.index.as_str(), expiry_label.as_str()],
                failed as f64,
            );
        }

        debug!(
            index = %state.index,
            rule = %state.rule,
            solved,
            failed,
            "iv estimation finished"
        );
        Ok(())
    }
}
