// =============================================================================
// summarize — terminal phase: emit the per-expiry completion event
// =============================================================================
//
// Never fails the cycle. The executor finalizes `pipeline_summary` itself
// after the last phase; this phase's job is the outward `expiry.complete`
// event with the headline numbers.
// =============================================================================

use async_trait::async_trait;
use tracing::info;

use crate::events::StructuredEvent;
use crate::pipeline::{ExpiryState, Phase, PhaseContext, PhaseError};

pub struct SummarizePhase;

#[async_trait]
impl Phase for SummarizePhase {
    fn name(&self) -> &'static str {
        "summarize"
    }

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError> {
        let detail = serde_json::json!({
            "expiry_date": state.expiry_date.map(|d| d.to_string()),
            "option_count": state.enriched.len(),
            "strike_count": state.strikes.len(),
            "persisted": state.flags.persisted,
            "classification": state.expiry_rec.classification,
            "error_count": state.errors.len(),
        });
        let event = StructuredEvent::new("expiry.complete")
            .with_index(state.index.clone())
            .with_rule(state.rule.as_str())
            .with_detail(detail);
        (ctx.emit)(event);

        info!(
            index = %state.index,
            rule = %state.rule,
            options = state.enriched.len(),
            errors = state.errors.len(),
            "expiry processing complete"
        );
        Ok(())
    }
}
