// =============================================================================
// Shared types used across the G6 collection engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Expiry selection rule. The discriminants double as bit values for the
/// expected/collected/missing masks in the overview snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryRule {
    ThisWeek,
    NextWeek,
    ThisMonth,
    NextMonth,
}

impl ExpiryRule {
    /// Bit value of this rule inside an expiry mask.
    pub fn bit(self) -> u8 {
        match self {
            Self::ThisWeek => 1,
            Self::NextWeek => 2,
            Self::ThisMonth => 4,
            Self::NextMonth => 8,
        }
    }

    /// All rules in canonical order.
    pub fn all() -> [ExpiryRule; 4] {
        [Self::ThisWeek, Self::NextWeek, Self::ThisMonth, Self::NextMonth]
    }

    /// Parse the stable config token ("this_week", ...).
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "this_week" => Some(Self::ThisWeek),
            "next_week" => Some(Self::NextWeek),
            "this_month" => Some(Self::ThisMonth),
            "next_month" => Some(Self::NextMonth),
            _ => None,
        }
    }

    /// Stable token used in config files, metrics labels, and panels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThisWeek => "this_week",
            Self::NextWeek => "next_week",
            Self::ThisMonth => "this_month",
            Self::NextMonth => "next_month",
        }
    }
}

impl std::fmt::Display for ExpiryRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call or put side of an option instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Exchange-style side code used in persisted column prefixes.
    pub fn side_code(self) -> &'static str {
        match self {
            Self::Call => "ce",
            Self::Put => "pe",
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "CE"),
            Self::Put => write!(f, "PE"),
        }
    }
}

/// Shadow-pipeline gating mode. `Off` disables the parity controller
/// entirely; `Dryrun` scores but never activates; `Canary` activates for the
/// scoped subset; `Promote` may hand authority to the new pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatingMode {
    Off,
    Dryrun,
    Canary,
    Promote,
}

impl Default for GatingMode {
    fn default() -> Self {
        Self::Off
    }
}

impl std::fmt::Display for GatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Dryrun => write!(f, "dryrun"),
            Self::Canary => write!(f, "canary"),
            Self::Promote => write!(f, "promote"),
        }
    }
}

/// A single listed option instrument as returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentRecord {
    /// Provider-scoped unique identifier.
    pub id: String,
    /// Trading symbol, e.g. "NIFTY24AUG22500CE".
    pub symbol: String,
    /// Index root the symbol belongs to, e.g. "NIFTY".
    pub root: String,
    pub strike: f64,
    pub option_type: OptionType,
    /// Contract expiry date.
    pub expiry: chrono::NaiveDate,
}

/// A market quote for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: u64,
    pub open_interest: u64,
    /// Epoch seconds of the quote as stamped by the provider.
    pub timestamp: i64,
}

/// Black-Scholes sensitivities for one option.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    /// Per calendar day.
    pub theta: f64,
    /// Per 1 percentage point of volatility.
    pub vega: f64,
    /// Per 1 percentage point of rate.
    pub rho: f64,
}

/// An instrument joined with its quote and (optionally) model outputs. This
/// is the value type of `ExpiryState::enriched`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedOption {
    pub strike: f64,
    pub option_type: OptionType,
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: u64,
    pub open_interest: u64,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeks: Option<Greeks>,
}

impl EnrichedOption {
    /// Join an instrument with its quote. Model fields start unset.
    pub fn from_parts(inst: &InstrumentRecord, quote: &QuoteRecord) -> Self {
        Self {
            strike: inst.strike,
            option_type: inst.option_type,
            symbol: inst.symbol.clone(),
            price: quote.last_price,
            bid: quote.bid,
            ask: quote.ask,
            volume: quote.volume,
            open_interest: quote.open_interest,
            timestamp: quote.timestamp,
            iv: None,
            greeks: None,
        }
    }

    /// Mid price when both sides are live, otherwise the last trade.
    pub fn mid_or_last(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.price
        }
    }
}

/// Per-index per-cycle overview written after all expiries complete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverviewSnapshot {
    /// Put/call open-interest ratio per rule bucket. Buckets with zero call
    /// open interest are omitted rather than reported as infinity.
    pub pcr: std::collections::HashMap<String, f64>,
    pub expiries_expected: u32,
    pub expiries_collected: u32,
    pub expected_mask: u8,
    pub collected_mask: u8,
    pub missing_mask: u8,
    /// Observed span of quote timestamps across the cycle, in seconds.
    pub day_width: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_bits_are_distinct_powers_of_two() {
        let bits: Vec<u8> = ExpiryRule::all().iter().map(|r| r.bit()).collect();
        assert_eq!(bits, vec![1, 2, 4, 8]);
    }

    #[test]
    fn rule_token_roundtrip() {
        for rule in ExpiryRule::all() {
            assert_eq!(ExpiryRule::parse(rule.as_str()), Some(rule));
        }
        assert_eq!(ExpiryRule::parse("fortnight"), None);
    }

    #[test]
    fn option_type_codes() {
        assert_eq!(OptionType::Call.side_code(), "ce");
        assert_eq!(OptionType::Put.side_code(), "pe");
        assert_eq!(OptionType::Put.to_string(), "PE");
    }

    #[test]
    fn mid_falls_back_to_last_when_book_empty() {
        let inst = InstrumentRecord {
            id: "1".into(),
            symbol: "NIFTY24AUG22500CE".into(),
            root: "NIFTY".into(),
            strike: 22500.0,
            option_type: OptionType::Call,
            expiry: chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap(),
        };
        let quote = QuoteRecord {
            last_price: 101.5,
            bid: 0.0,
            ask: 0.0,
            volume: 10,
            open_interest: 100,
            timestamp: 0,
        };
        let e = EnrichedOption::from_parts(&inst, &quote);
        assert_eq!(e.mid_or_last(), 101.5);
    }
}
