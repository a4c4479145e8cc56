// =============================================================================
// Phase library — the thirteen pipeline steps in execution order
// =============================================================================

pub mod classify;
pub mod coverage;
pub mod enrich;
pub mod fetch;
pub mod greeks;
pub mod iv;
pub mod persist;
pub mod prefilter;
pub mod resolve;
pub mod salvage;
pub mod snapshot;
pub mod summarize;
pub mod validate;

use std::sync::Arc;

use super::Phase;

/// The standard pipeline in its fixed order.
pub fn standard_phases() -> Vec<Arc<dyn Phase>> {
    vec![
        Arc::new(resolve::ResolvePhase),
        Arc::new(fetch::FetchPhase),
        Arc::new(prefilter::PrefilterPhase),
        Arc::new(enrich::EnrichPhase),
        Arc::new(validate::ValidatePhase),
        Arc::new(salvage::SalvagePhase),
        Arc::new(coverage::CoveragePhase),
        Arc::new(iv::IvPhase),
        Arc::new(greeks::GreeksPhase),
        Arc::new(persist::PersistPhase),
        Arc::new(classify::ClassifyPhase),
        Arc::new(snapshot::SnapshotPhase),
        Arc::new(summarize::SummarizePhase),
    ]
}
