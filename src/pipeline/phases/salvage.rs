// =============================================================================
// salvage — small recovery of foreign-expiry or partially enriched rows
// =============================================================================
//
// Only runs when enabled. Repairs at most SALVAGE_LIMIT records: drops
// foreign-expiry instruments and trims strikes that never enriched. Never
// fabricates quotes. A larger mess is left for validate's findings to
// surface.
// =============================================================================

use async_trait::async_trait;
use tracing::info;

use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

/// Maximum records one salvage pass may repair.
const SALVAGE_LIMIT: usize = 3;

pub struct SalvagePhase;

#[async_trait]
impl Phase for SalvagePhase {
    fn name(&self) -> &'static str {
        "salvage"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        if !ctx.config.pipeline.salvage_enabled {
            return Ok(());
        }
        let Some(expiry) = state.expiry_date else {
            return Ok(());
        };

        let mut repaired = 0usize;

        // Foreign-expiry rows: drop them (and their enrichment) if few.
        let foreign: Vec<String> = state
            .instruments
            .iter()
            .filter(|i| i.expiry != expiry)
            .map(|i| i.id.clone())
            .collect();
        if !foreign.is_empty() && foreign.len() <= SALVAGE_LIMIT {
            state.instruments.retain(|i| i.expiry == expiry);
            for id in &foreign {
                state.enriched.remove(id);
            }
            repaired += foreign.len();
        }

        // Partial enrichment: trim strikes with no enriched record at all.
        if state.flags.partial && repaired < SALVAGE_LIMIT {
            let enriched_strikes: std::collections::HashSet<u64> = state
                .enriched
                .values()
                .map(|e| e.strike.to_bits())
                .collect();
            let dead: Vec<f64> = state
                .strikes
                .iter()
                .copied()
                .filter(|s| !enriched_strikes.contains(&s.to_bits()))
                .take(SALVAGE_LIMIT - repaired)
                .collect();
            if !dead.is_empty() {
                state
                    .strikes
                    .retain(|s| !dead.iter().any(|d| d.to_bits() == s.to_bits()));
                repaired += dead.len();
            }
        }

        if repaired > 0 {
            state.flags.salvaged = true;
            ctx.batcher
                .inc(&ctx.metrics.expiry_salvage, &[state.index.as_str()], 1.0);
            info!(
                index = %state.index,
                rule = %state.rule,
                repaired,
                "expiry salvaged"
            );
        }
        Ok(())
    }
}
