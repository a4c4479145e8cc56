// =============================================================================
// Sink layer — append-only persistence for option rows and overviews
// =============================================================================
//
// The persist phase writes through the `OptionSink` trait. The contract is
// append-only with additive columns and stable `ce_*`/`pe_*` naming for the
// side-specific fields; one row carries both sides of a strike.
// =============================================================================

pub mod csv;
pub mod mem;

use anyhow::Result;
use serde::Serialize;

pub use self::csv::CsvSink;
pub use self::mem::MemSink;

use crate::types::OverviewSnapshot;

/// Side-specific columns of one persisted row.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SideFields {
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: u64,
    pub open_interest: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vega: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rho: Option<f64>,
}

/// One persisted row: a strike with its call and put sides.
#[derive(Debug, Clone, Serialize)]
pub struct OptionRow {
    /// Epoch seconds of the collection.
    pub timestamp: i64,
    pub index: String,
    pub expiry: chrono::NaiveDate,
    pub strike: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ce: Option<SideFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pe: Option<SideFields>,
}

/// Append-only persistence target. Implementations must tolerate repeated
/// writes of the same cycle (the executor may retry persist).
pub trait OptionSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Append option rows for one (index, rule, expiry) collection.
    fn write_option_rows(&self, rule: &str, rows: &[OptionRow]) -> Result<()>;

    /// Append one per-index overview row.
    fn write_overview(&self, index: &str, overview: &OverviewSnapshot) -> Result<()>;

    /// Flush buffered data to stable storage.
    fn flush(&self) -> Result<()>;
}
