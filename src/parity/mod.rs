// =============================================================================
// Parity layer — structural comparison of shadow vs legacy pipelines
// =============================================================================

pub mod gating;
pub mod hash;
pub mod score;

pub use gating::{GatingController, GatingDecision, ParitySample};
pub use hash::{digest_state, parity_hash_v2, StateDigest};
pub use score::{parity_score, weighted_alert_parity, AlertSample, ParityScore, ScoreInputs};
