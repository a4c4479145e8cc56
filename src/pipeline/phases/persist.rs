// =============================================================================
// persist — emit per-option rows to the configured sinks
// =============================================================================
//
// Rows pair the call and put side of each strike. Transient sink failures
// retry a bounded number of times inside the phase; a still-failing sink is
// a permanent failure and fatal for the index.
// =============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};
use crate::sinks::{OptionRow, SideFields};
use crate::types::OptionType;

/// Write attempts per sink before the failure is considered permanent.
const SINK_ATTEMPTS: u32 = 3;

pub struct PersistPhase;

impl PersistPhase {
    fn side_fields(rec: &crate::types::EnrichedOption) -> SideFields {
        SideFields {
            price: rec.price,
            bid: rec.bid,
            ask: rec.ask,
            volume: rec.volume,
            open_interest: rec.open_interest,
            iv: rec.iv,
            delta: rec.greeks.map(|g| g.delta),
            gamma: rec.greeks.map(|g| g.gamma),
            theta: rec.greeks.map(|g| g.theta),
            vega: rec.greeks.map(|g| g.vega),
            rho: rec.greeks.map(|g| g.rho),
        }
    }

    /// One row per strike, both sides attached where present.
    fn build_rows(ctx: &PhaseContext, state: &ExpiryState) -> Vec<OptionRow> {
        let Some(expiry) = state.expiry_date else {
            return Vec::new();
        };
        let mut by_strike: BTreeMap<u64, OptionRow> = BTreeMap::new();
        for rec in state.enriched.values() {
            let row = by_strike
                .entry(rec.strike.to_bits())
                .or_insert_with(|| OptionRow {
                    timestamp: ctx.cycle_ts,
                    index: state.index.clone(),
                    expiry,
                    strike: rec.strike,
                    ce: None,
                    pe: None,
                });
            match rec.option_type {
                OptionType::Call => row.ce = Some(Self::side_fields(rec)),
                OptionType::Put => row.pe = Some(Self::side_fields(rec)),
            }
        }
        by_strike.into_values().collect()
    }
}

#[async_trait]
impl Phase for PersistPhase {
    fn name(&self) -> &'static str {
        "persist"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let rows = Self::build_rows(ctx, state);
        if rows.is_empty() {
            return Err(PhaseError::recoverable("persist_no_rows"));
        }

        for sink in ctx.sinks.iter() {
            let mut last_err = None;
            for attempt in 1..=SINK_ATTEMPTS {
                match sink.write_option_rows(state.rule.as_str(), &rows) {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            sink = sink.name(),
                            index = %state.index,
                            attempt,
                            error = %e,
                            "sink write failed"
                        );
                        last_err = Some(e);
                    }
                }
            }
            if let Some(e) = last_err {
                return Err(PhaseError::fatal_with("persist_sink", e.to_string()));
            }
        }

        state.flags.persisted = true;
        state.expiry_rec.persist_count = Some(state.enriched.len());
        debug!(
            index = %state.index,
            rule = %state.rule,
            rows = rows.len(),
            options = state.enriched.len(),
            "options persisted"
        );
        Ok(())
    }
}
