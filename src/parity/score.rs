// =============================================================================
// Parity scoring — component similarity between legacy and shadow outputs
// =============================================================================
//
// v1 is the equal-weight mean of index_count, option_count, and alert-set
// similarity. v2 adds a strike_coverage component. Component weights can be
// overridden with a "comp:weight,comp:weight" string. The weighted alert
// parity scores severity categories instead of raw sets.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::warn;

/// Per-side inputs to the parity score.
#[derive(Debug, Clone, Default)]
pub struct ScoreInputs {
    pub index_count: usize,
    pub option_count: usize,
    /// Canonical alert tokens: structured alerts contribute their category,
    /// plain strings contribute themselves; the set is deduplicated.
    pub alerts: BTreeSet<String>,
    /// Average strike coverage per index (v2 component).
    pub strike_coverage: HashMap<String, f64>,
}

/// Score with its per-component breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct ParityScore {
    pub score: f64,
    pub components: BTreeMap<String, f64>,
    pub version: u8,
}

fn count_similarity(l: usize, p: usize) -> f64 {
    let denom = l.max(p).max(1) as f64;
    1.0 - ((l as f64 - p as f64).abs() / denom).min(1.0)
}

fn alert_similarity(l: &BTreeSet<String>, p: &BTreeSet<String>) -> f64 {
    let union: BTreeSet<&String> = l.union(p).collect();
    if union.is_empty() {
        return 1.0;
    }
    let sym_diff = l.symmetric_difference(p).count();
    1.0 - sym_diff as f64 / union.len() as f64
}

fn coverage_similarity(l: &HashMap<String, f64>, p: &HashMap<String, f64>) -> f64 {
    let indices: BTreeSet<&String> = l.keys().chain(p.keys()).collect();
    if indices.is_empty() {
        return 1.0;
    }
    let total: f64 = indices
        .iter()
        .map(|idx| match (l.get(*idx), p.get(*idx)) {
            (Some(a), Some(b)) => 1.0 - (a - b).abs().min(1.0),
            _ => 0.0,
        })
        .sum();
    total / indices.len() as f64
}

/// Parse "comp:weight,comp:weight" overrides. Malformed entries are skipped
/// with a warning.
fn parse_weights(spec: Option<&str>) -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    let Some(spec) = spec else {
        return weights;
    };
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once(':').and_then(|(name, w)| {
            w.trim().parse::<f64>().ok().map(|w| (name.trim().to_string(), w))
        }) {
            Some((name, w)) if w >= 0.0 => {
                weights.insert(name, w);
            }
            _ => warn!(entry = part, "ignoring malformed parity weight override"),
        }
    }
    weights
}

/// Compute the parity score. `extended` selects v2 (adds strike_coverage).
pub fn parity_score(
    legacy: &ScoreInputs,
    shadow: &ScoreInputs,
    extended: bool,
    weight_overrides: Option<&str>,
) -> ParityScore {
    let mut components = BTreeMap::new();
    components.insert(
        "index_count".to_string(),
        count_similarity(legacy.index_count, shadow.index_count),
    );
    components.insert(
        "option_count".to_string(),
        count_similarity(legacy.option_count, shadow.option_count),
    );
    components.insert(
        "alerts".to_string(),
        alert_similarity(&legacy.alerts, &shadow.alerts),
    );
    if extended {
        components.insert(
            "strike_coverage".to_string(),
            coverage_similarity(&legacy.strike_coverage, &shadow.strike_coverage),
        );
    }

    let overrides = parse_weights(weight_overrides);
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for (name, value) in &components {
        let weight = overrides.get(name).copied().unwrap_or(1.0);
        weighted_sum += weight * value;
        weight_total += weight;
    }
    let score = if weight_total > 0.0 {
        weighted_sum / weight_total
    } else {
        0.0
    };

    ParityScore {
        score,
        components,
        version: if extended { 2 } else { 1 },
    }
}

// =============================================================================
// Weighted alert parity
// =============================================================================

/// One alert for the severity-weighted comparison.
#[derive(Debug, Clone)]
pub struct AlertSample {
    pub category: String,
    pub severity: String,
}

/// Normalized weighted difference of two alert populations, 0 (identical)
/// to 1 (disjoint). Categories in the symmetric difference contribute their
/// severity weight; the result is normalized by the union's weight.
pub fn weighted_alert_parity(
    legacy: &[AlertSample],
    shadow: &[AlertSample],
    severity_weights: &HashMap<String, f64>,
) -> f64 {
    let weight_of = |alerts: &[AlertSample], category: &str| -> f64 {
        alerts
            .iter()
            .find(|a| a.category == category)
            .map(|a| severity_weights.get(&a.severity).copied().unwrap_or(1.0))
            .unwrap_or(1.0)
    };

    let l_cats: BTreeSet<&str> = legacy.iter().map(|a| a.category.as_str()).collect();
    let p_cats: BTreeSet<&str> = shadow.iter().map(|a| a.category.as_str()).collect();

    let union: BTreeSet<&str> = l_cats.union(&p_cats).copied().collect();
    if union.is_empty() {
        return 0.0;
    }

    let mut diff_weight = 0.0;
    let mut union_weight = 0.0;
    for cat in &union {
        let in_l = l_cats.contains(cat);
        let in_p = p_cats.contains(cat);
        let w = if in_l {
            weight_of(legacy, cat)
        } else {
            weight_of(shadow, cat)
        };
        union_weight += w;
        if in_l != in_p {
            diff_weight += w;
        }
    }
    if union_weight == 0.0 {
        0.0
    } else {
        diff_weight / union_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(index_count: usize, option_count: usize, alerts: &[&str]) -> ScoreInputs {
        ScoreInputs {
            index_count,
            option_count,
            alerts: alerts.iter().map(|s| s.to_string()).collect(),
            strike_coverage: HashMap::new(),
        }
    }

    #[test]
    fn identical_sides_score_one() {
        let l = inputs(2, 100, &["stale_quote"]);
        let p = inputs(2, 100, &["stale_quote"]);
        let score = parity_score(&l, &p, false, None);
        assert!((score.score - 1.0).abs() < 1e-12);
        assert_eq!(score.version, 1);
    }

    #[test]
    fn count_divergence_lowers_component() {
        let l = inputs(2, 100, &[]);
        let p = inputs(2, 50, &[]);
        let score = parity_score(&l, &p, false, None);
        assert!((score.components["option_count"] - 0.5).abs() < 1e-12);
        assert_eq!(score.components["index_count"], 1.0);
        // Empty alert union scores 1.
        assert_eq!(score.components["alerts"], 1.0);
    }

    #[test]
    fn alert_symmetric_difference_over_union() {
        let l = inputs(1, 10, &["a", "b"]);
        let p = inputs(1, 10, &["b", "c"]);
        let score = parity_score(&l, &p, false, None);
        // union {a,b,c}, sym diff {a,c} -> 1 - 2/3.
        assert!((score.components["alerts"] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn extended_adds_strike_coverage_component() {
        let mut l = inputs(1, 10, &[]);
        let mut p = inputs(1, 10, &[]);
        l.strike_coverage.insert("NIFTY".to_string(), 0.9);
        p.strike_coverage.insert("NIFTY".to_string(), 0.7);
        let score = parity_score(&l, &p, true, None);
        assert_eq!(score.version, 2);
        assert!((score.components["strike_coverage"] - 0.8).abs() < 1e-9);
    }

    #[test]
    fn weight_overrides_reweight_components() {
        let l = inputs(2, 100, &[]);
        let p = inputs(2, 50, &[]);
        // Zero out the diverging component; remaining components are 1.
        let score = parity_score(&l, &p, false, Some("option_count:0"));
        assert!((score.score - 1.0).abs() < 1e-12);
        // Malformed entries are ignored without panicking.
        let score2 = parity_score(&l, &p, false, Some("nonsense,option_count:xyz"));
        assert!(score2.score < 1.0);
    }

    #[test]
    fn weighted_alert_parity_weighs_severity() {
        let weights: HashMap<String, f64> =
            [("critical".to_string(), 4.0), ("info".to_string(), 1.0)].into();
        let legacy = vec![AlertSample {
            category: "sink_down".to_string(),
            severity: "critical".to_string(),
        }];
        let shadow = vec![AlertSample {
            category: "slow_quote".to_string(),
            severity: "info".to_string(),
        }];
        // Disjoint: diff weight 5, union weight 5.
        let diff = weighted_alert_parity(&legacy, &shadow, &weights);
        assert!((diff - 1.0).abs() < 1e-12);

        // Identical populations carry no difference.
        let same = weighted_alert_parity(&legacy, &legacy.clone(), &weights);
        assert_eq!(same, 0.0);

        // Empty union is zero difference.
        assert_eq!(weighted_alert_parity(&[], &[], &weights), 0.0);
    }
}
