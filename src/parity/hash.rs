// =============================================================================
// Parity hash v2 — compact structural fingerprint of an ExpiryState
// =============================================================================
//
// The fingerprint covers expiry date, strike and instrument counts, the
// sorted head of the strike ladder, coverage components, the simulated
// persist option count, and the synthetic PCR. Hashing the canonical JSON
// of the digest (sorted keys, compact separators) and truncating to 16 hex
// keeps the value stable across recomputation.
// =============================================================================

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::pipeline::ExpiryState;

/// Strikes carried in the fingerprint head.
const STRIKE_HEAD: usize = 5;

/// The structural fields parity compares, extracted from an ExpiryState.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateDigest {
    pub expiry_date: Option<String>,
    pub strike_count: usize,
    pub instrument_count: usize,
    /// Sorted head of the strike ladder.
    pub strikes_head: Vec<f64>,
    pub strike_coverage: f64,
    pub covered_strikes: usize,
    /// Options the persist phase wrote (or would write).
    pub persist_count: usize,
    /// Synthetic PCR over enriched open interest.
    pub pcr: Option<f64>,
}

/// Extract the parity digest from a processed state.
pub fn digest_state(state: &ExpiryState) -> StateDigest {
    let mut strikes_head: Vec<f64> = state.strikes.clone();
    strikes_head.sort_by(|a, b| a.partial_cmp(b).expect("finite strikes"));
    strikes_head.truncate(STRIKE_HEAD);

    let coverage = state.expiry_rec.coverage.as_ref();
    StateDigest {
        expiry_date: state.expiry_date.map(|d| d.to_string()),
        strike_count: state.strikes.len(),
        instrument_count: state.instruments.len(),
        strikes_head,
        strike_coverage: coverage.map(|c| c.strike_coverage).unwrap_or(0.0),
        covered_strikes: coverage.map(|c| c.covered_strikes).unwrap_or(0),
        persist_count: state
            .expiry_rec
            .persist_count
            .unwrap_or_else(|| state.enriched.len()),
        pcr: state.expiry_rec.pcr,
    }
}

/// 16-hex parity hash over the digest's canonical JSON.
pub fn parity_hash_v2(digest: &StateDigest) -> String {
    let canonical = serde_json::to_string(digest).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))[..16].to_string()
}

/// Fields of the digest that differ between two sides.
pub fn diff_fields(a: &StateDigest, b: &StateDigest) -> std::collections::BTreeSet<String> {
    let mut diffs = std::collections::BTreeSet::new();
    if a.expiry_date != b.expiry_date {
        diffs.insert("expiry_date".to_string());
    }
    if a.strike_count != b.strike_count {
        diffs.insert("strike_count".to_string());
    }
    if a.instrument_count != b.instrument_count {
        diffs.insert("instrument_count".to_string());
    }
    if a.strikes_head != b.strikes_head {
        diffs.insert("strikes_head".to_string());
    }
    if (a.strike_coverage - b.strike_coverage).abs() > 1e-9 {
        diffs.insert("strike_coverage".to_string());
    }
    if a.persist_count != b.persist_count {
        diffs.insert("persist_count".to_string());
    }
    match (a.pcr, b.pcr) {
        (Some(x), Some(y)) if (x - y).abs() > 1e-9 => {
            diffs.insert("pcr".to_string());
        }
        (Some(_), None) | (None, Some(_)) => {
            diffs.insert("pcr".to_string());
        }
        _ => {}
    }
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExpiryRule;

    fn sample_state() -> ExpiryState {
        let mut state = ExpiryState::new("NIFTY", ExpiryRule::ThisWeek);
        state.expiry_date = chrono::NaiveDate::from_ymd_opt(2024, 8, 29);
        state.strikes = vec![22_300.0, 22_400.0, 22_500.0, 22_600.0, 22_700.0, 22_800.0];
        state.expiry_rec.persist_count = Some(12);
        state.expiry_rec.pcr = Some(0.92);
        state
    }

    #[test]
    fn hash_recomputation_is_bit_identical() {
        let digest = digest_state(&sample_state());
        let a = parity_hash_v2(&digest);
        let b = parity_hash_v2(&digest_state(&sample_state()));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn strikes_head_is_sorted_and_capped() {
        let digest = digest_state(&sample_state());
        assert_eq!(digest.strikes_head.len(), STRIKE_HEAD);
        assert_eq!(digest.strikes_head[0], 22_300.0);
    }

    #[test]
    fn structural_change_changes_hash_and_diffs() {
        let base = digest_state(&sample_state());
        let mut other_state = sample_state();
        other_state.instruments.push(crate::types::InstrumentRecord {
            id: "x".to_string(),
            symbol: "NIFTYx".to_string(),
            root: "NIFTY".to_string(),
            strike: 22_500.0,
            option_type: crate::types::OptionType::Call,
            expiry: other_state.expiry_date.unwrap(),
        });
        let other = digest_state(&other_state);

        assert_ne!(parity_hash_v2(&base), parity_hash_v2(&other));
        let diffs = diff_fields(&base, &other);
        assert!(diffs.contains("instrument_count"));
        assert!(!diffs.contains("expiry_date"));
    }
}
