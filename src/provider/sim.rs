// =============================================================================
// Sim Backend — deterministic in-process provider
// =============================================================================
//
// Serves a scripted instrument universe, expiry catalogue, and quote book.
// Used by the test suite and by demo mode, where the engine runs end to end
// without live credentials. Failure injection covers the executor's retry
// paths: a scripted number of leading calls can fail with a chosen error.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};

use crate::market_hours;
use crate::types::{InstrumentRecord, OptionType, QuoteRecord};

use super::{Capabilities, HealthStatus, ProviderBackend, ProviderError};

pub struct SimBackend {
    name: &'static str,
    instruments: Vec<InstrumentRecord>,
    expiries: Vec<NaiveDate>,
    quotes: HashMap<String, QuoteRecord>,
    /// Spot per index symbol, served through `get_ltp`.
    spots: HashMap<String, f64>,
    /// Leading `get_instruments` calls that fail with Transient.
    instrument_failures: AtomicU32,
    /// Leading `get_quotes` calls that fail with NoQuotes.
    quote_failures: AtomicU32,
}

impl SimBackend {
    pub fn new(
        instruments: Vec<InstrumentRecord>,
        expiries: Vec<NaiveDate>,
        quotes: HashMap<String, QuoteRecord>,
        spots: HashMap<String, f64>,
    ) -> Self {
        Self {
            name: "sim",
            instruments,
            expiries,
            quotes,
            spots,
            instrument_failures: AtomicU32::new(0),
            quote_failures: AtomicU32::new(0),
        }
    }

    /// Empty backend under a specific registry name.
    pub fn named(name: &'static str) -> Self {
        let mut b = Self::new(Vec::new(), Vec::new(), HashMap::new(), HashMap::new());
        b.name = name;
        b
    }

    /// Backend with no universe at all.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), HashMap::new(), HashMap::new())
    }

    /// "Today" that fixture expiries are generated relative to.
    pub fn fixture_today() -> NaiveDate {
        chrono::Utc::now().date_naive()
    }

    /// A NIFTY option chain: the next four weekly Thursdays plus the last
    /// Thursday of this and next month, strikes 22300..22700 around a 22500
    /// spot, quotes for every instrument.
    pub fn nifty_fixture() -> Self {
        let today = Self::fixture_today();
        let mut expiries = market_hours::near_thursdays(today, 4);
        for offset in [0u32, 1] {
            if let Some(d) = last_thursday_of_month(today, offset) {
                if d >= today && !expiries.contains(&d) {
                    expiries.push(d);
                }
            }
        }
        expiries.sort();

        let strikes: Vec<f64> = (0..5).map(|i| 22_300.0 + 100.0 * i as f64).collect();
        let mut instruments = Vec::new();
        let mut quotes = HashMap::new();
        for expiry in &expiries {
            for strike in &strikes {
                for side in [OptionType::Call, OptionType::Put] {
                    let id = format!("{}-{}-{}", expiry, strike, side);
                    let symbol = format!(
                        "NIFTY{}{}{}",
                        expiry.format("%y%b").to_string().to_uppercase(),
                        *strike as u64,
                        side
                    );
                    instruments.push(InstrumentRecord {
                        id: id.clone(),
                        symbol,
                        root: "NIFTY".to_string(),
                        strike: *strike,
                        option_type: side,
                        expiry: *expiry,
                    });
                    let moneyness = (22_500.0 - strike).abs() / 100.0;
                    quotes.insert(
                        id,
                        QuoteRecord {
                            last_price: 120.0 - 20.0 * moneyness,
                            bid: 119.0 - 20.0 * moneyness,
                            ask: 121.0 - 20.0 * moneyness,
                            volume: 1_000 + 100 * moneyness as u64,
                            open_interest: 10_000 + 1_000 * moneyness as u64,
                            timestamp: chrono::Utc::now().timestamp(),
                        },
                    );
                }
            }
        }

        let mut spots = HashMap::new();
        spots.insert("NIFTY".to_string(), 22_500.0);
        Self::new(instruments, expiries, quotes, spots)
    }

    /// Universe present but no expiry catalogue (forces fabrication).
    pub fn no_expiries() -> Self {
        let mut b = Self::nifty_fixture();
        b.expiries.clear();
        b
    }

    pub fn with_instrument_failures(self, n: u32) -> Self {
        self.instrument_failures.store(n, Ordering::Relaxed);
        self
    }

    pub fn with_quote_failures(self, n: u32) -> Self {
        self.quote_failures.store(n, Ordering::Relaxed);
        self
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// Last Thursday of the month `offset` months after the month of `from`.
fn last_thursday_of_month(from: NaiveDate, offset: u32) -> Option<NaiveDate> {
    let month0 = from.month0() + offset;
    let year = from.year() + (month0 / 12) as i32;
    let month = month0 % 12 + 1;
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut day = first_next.pred_opt()?;
    while day.weekday() != chrono::Weekday::Thu {
        day = day.pred_opt()?;
    }
    Some(day)
}

#[async_trait]
impl ProviderBackend for SimBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    async fn get_instruments(
        &self,
        _exchange: &str,
    ) -> Result<Vec<InstrumentRecord>, ProviderError> {
        if Self::take_failure(&self.instrument_failures) {
            return Err(ProviderError::Transient("scripted instrument failure".into()));
        }
        Ok(self.instruments.clone())
    }

    async fn resolve_expiries(&self, index: &str) -> Result<Vec<NaiveDate>, ProviderError> {
        if self.expiries.is_empty() {
            return Err(ProviderError::ResolveExpiry {
                index: index.to_string(),
                reason: "catalogue empty".to_string(),
            });
        }
        Ok(self.expiries.clone())
    }

    async fn get_quotes(
        &self,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, QuoteRecord>, ProviderError> {
        if Self::take_failure(&self.quote_failures) {
            return Err(ProviderError::NoQuotes(instrument_ids.len()));
        }
        let found: HashMap<String, QuoteRecord> = instrument_ids
            .iter()
            .filter_map(|id| self.quotes.get(id).map(|q| (id.clone(), q.clone())))
            .collect();
        if found.is_empty() {
            return Err(ProviderError::NoQuotes(instrument_ids.len()));
        }
        Ok(found)
    }

    async fn get_ltp(
        &self,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, f64>, ProviderError> {
        Ok(instrument_ids
            .iter()
            .map(|id| {
                let price = self
                    .spots
                    .get(id)
                    .copied()
                    .or_else(|| self.quotes.get(id).map(|q| q.last_price))
                    .unwrap_or(0.0);
                (id.clone(), price)
            })
            .collect())
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}
