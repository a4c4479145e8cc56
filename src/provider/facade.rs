// =============================================================================
// Provider Facade — caching, rate limiting, and classified access
// =============================================================================
//
// The facade is the only provider surface the pipeline sees. It wraps a
// registered backend with:
//
//   - an instrument cache (long TTL, short TTL override after an empty
//     response to avoid tight refetch loops)
//   - a quote cache (TTL seconds, 0 disables)
//   - a one-shot immediate retry when the instrument universe comes back
//     empty the first time
//   - a token-bucket rate limiter ahead of every upstream call
//   - throttled `fallback` / `quote_fallback` warn sinks (at most one
//     warning per interval, suppressed count carried on the next emit)
//   - immutable credential snapshots; rotation swaps the Arc, in-flight
//     calls keep the snapshot they started with
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::market_hours;
use crate::types::{ExpiryRule, InstrumentRecord, QuoteRecord};

use super::{HealthStatus, ProviderBackend, ProviderError};

// =============================================================================
// Credentials
// =============================================================================

/// Immutable credential snapshot. Rotations produce a new snapshot; callers
/// holding the old Arc continue on it.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialsSnapshot {
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    /// Where the credentials were discovered ("env", "file", "manual").
    pub source: String,
    /// Epoch seconds at snapshot creation.
    pub created_at: i64,
    pub discovered: bool,
    pub complete: bool,
}

impl CredentialsSnapshot {
    pub fn from_env() -> Self {
        let api_key = std::env::var("G6_API_KEY").unwrap_or_default();
        let access_token = std::env::var("G6_ACCESS_TOKEN").unwrap_or_default();
        let discovered = !api_key.is_empty() || !access_token.is_empty();
        let complete = !api_key.is_empty() && !access_token.is_empty();
        Self {
            api_key,
            access_token,
            source: "env".to_string(),
            created_at: chrono::Utc::now().timestamp(),
            discovered,
            complete,
        }
    }

    pub fn age_seconds(&self) -> i64 {
        (chrono::Utc::now().timestamp() - self.created_at).max(0)
    }
}

// =============================================================================
// Rate limiter
// =============================================================================

/// Token bucket: `rate` tokens per second up to `burst`. Callers await
/// capacity rather than erroring.
struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate: rate.max(0.1),
            burst: burst.max(1.0),
            state: Mutex::new((burst.max(1.0), Instant::now())),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let (ref mut tokens, ref mut last) = *state;
                let elapsed = last.elapsed().as_secs_f64();
                *tokens = (*tokens + elapsed * self.rate).min(self.burst);
                *last = Instant::now();
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - *tokens) / self.rate))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

// =============================================================================
// Throttled log sink
// =============================================================================

/// Suppresses bursts while guaranteeing at least one warning per interval.
struct ThrottledLog {
    name: &'static str,
    min_interval: Duration,
    state: Mutex<(Option<Instant>, u64)>,
}

impl ThrottledLog {
    fn new(name: &'static str, min_interval: Duration) -> Self {
        Self {
            name,
            min_interval,
            state: Mutex::new((None, 0)),
        }
    }

    fn warn(&self, message: &str) {
        let emit = {
            let mut state = self.state.lock();
            let (ref mut last, ref mut suppressed) = *state;
            match last {
                Some(at) if at.elapsed() < self.min_interval => {
                    *suppressed += 1;
                    None
                }
                _ => {
                    *last = Some(Instant::now());
                    let count = *suppressed;
                    *suppressed = 0;
                    Some(count)
                }
            }
        };
        if let Some(suppressed) = emit {
            if suppressed > 0 {
                warn!(sink = self.name, suppressed, "{message}");
            } else {
                warn!(sink = self.name, "{message}");
            }
        }
    }
}

// =============================================================================
// Caches
// =============================================================================

struct InstrumentCacheEntry {
    fetched_at: Instant,
    ttl: Duration,
    records: Arc<Vec<InstrumentRecord>>,
}

struct QuoteCacheEntry {
    fetched_at: Instant,
    quote: QuoteRecord,
}

// =============================================================================
// Resolved expiries
// =============================================================================

/// Expiry catalogue for one index with derived weekly/monthly subsets. The
/// monthly subset is the last listed expiry of each calendar month; the
/// weekly subset is everything else.
#[derive(Debug, Clone)]
pub struct ResolvedExpiries {
    pub dates: Vec<NaiveDate>,
    pub weekly: Vec<NaiveDate>,
    pub monthly: Vec<NaiveDate>,
    pub fabricated: bool,
}

impl ResolvedExpiries {
    fn derive(mut dates: Vec<NaiveDate>, fabricated: bool) -> Self {
        dates.sort();
        dates.dedup();

        let mut last_of_month: HashMap<(i32, u32), NaiveDate> = HashMap::new();
        for d in &dates {
            let key = (d.year(), d.month());
            let entry = last_of_month.entry(key).or_insert(*d);
            if *d > *entry {
                *entry = *d;
            }
        }
        let monthly_set: std::collections::HashSet<NaiveDate> =
            last_of_month.into_values().collect();

        let mut monthly: Vec<NaiveDate> = monthly_set.iter().copied().collect();
        monthly.sort();
        let weekly: Vec<NaiveDate> = dates
            .iter()
            .copied()
            .filter(|d| !monthly_set.contains(d))
            .collect();

        Self {
            dates,
            weekly,
            monthly,
            fabricated,
        }
    }

    /// Pick the date an expiry rule maps to, relative to `today`. Returns
    /// None when the rule does not map cleanly onto the catalogue.
    pub fn select(&self, rule: ExpiryRule, today: NaiveDate) -> Option<NaiveDate> {
        let upcoming: Vec<NaiveDate> = self.dates.iter().copied().filter(|d| *d >= today).collect();
        match rule {
            ExpiryRule::ThisWeek => upcoming.first().copied(),
            ExpiryRule::NextWeek => upcoming.get(1).copied(),
            ExpiryRule::ThisMonth => self
                .monthly
                .iter()
                .copied()
                .find(|d| d.year() == today.year() && d.month() == today.month() && *d >= today),
            ExpiryRule::NextMonth => {
                let (next_y, next_m) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                self.monthly
                    .iter()
                    .copied()
                    .find(|d| d.year() == next_y && d.month() == next_m)
            }
        }
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Snapshot of the facade's internal counters, suitable for serialisation
/// into the status API and for the metrics sync at cycle end.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDiagnostics {
    pub provider: String,
    pub instrument_cache_size: usize,
    pub quote_cache_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
    pub fallback_events: u64,
    pub quote_fallback_events: u64,
    pub token_age_seconds: i64,
    pub credentials_complete: bool,
    pub last_fallback: bool,
    pub health: HealthStatus,
}

// =============================================================================
// ProviderFacade
// =============================================================================

pub struct ProviderFacade {
    backend: Arc<dyn ProviderBackend>,
    config: ProviderConfig,

    instrument_cache: RwLock<HashMap<String, InstrumentCacheEntry>>,
    quote_cache: RwLock<HashMap<String, QuoteCacheEntry>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    limiter: TokenBucket,
    fallback_log: ThrottledLog,
    quote_fallback_log: ThrottledLog,
    fallback_events: AtomicU64,
    quote_fallback_events: AtomicU64,

    credentials: RwLock<Arc<CredentialsSnapshot>>,
    last_fallback: AtomicBool,
    auth_failed: AtomicBool,
}

impl ProviderFacade {
    pub fn new(
        backend: Arc<dyn ProviderBackend>,
        config: ProviderConfig,
        credentials: CredentialsSnapshot,
    ) -> Self {
        let throttle = Duration::from_secs(config.throttle_log_interval_seconds.max(1));
        Self {
            limiter: TokenBucket::new(config.rate_limit_per_sec, config.rate_limit_burst),
            fallback_log: ThrottledLog::new("fallback", throttle),
            quote_fallback_log: ThrottledLog::new("quote_fallback", throttle),
            fallback_events: AtomicU64::new(0),
            quote_fallback_events: AtomicU64::new(0),
            backend,
            config,
            instrument_cache: RwLock::new(HashMap::new()),
            quote_cache: RwLock::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            credentials: RwLock::new(Arc::new(credentials)),
            last_fallback: AtomicBool::new(false),
            auth_failed: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Credentials
    // -------------------------------------------------------------------------

    /// Swap in a new credential snapshot. In-flight calls keep the old one.
    pub fn rotate_credentials(&self, snapshot: CredentialsSnapshot) {
        *self.credentials.write() = Arc::new(snapshot);
        self.auth_failed.store(false, Ordering::Relaxed);
    }

    pub fn credentials(&self) -> Arc<CredentialsSnapshot> {
        self.credentials.read().clone()
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    /// Instrument universe for an exchange segment, cached. An empty result
    /// is retried once immediately; a still-empty result is cached under the
    /// short empty TTL and returned as an empty vector.
    pub async fn get_instruments(
        &self,
        exchange: &str,
        force_refresh: bool,
    ) -> Result<Arc<Vec<InstrumentRecord>>, ProviderError> {
        if !force_refresh {
            if let Some(records) = self.cached_instruments(exchange) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(records);
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        self.limiter.acquire().await;
        let mut records = self.classify(self.backend.get_instruments(exchange).await)?;

        if records.is_empty() {
            // One-shot immediate retry before accepting an empty universe.
            self.limiter.acquire().await;
            records = self.classify(self.backend.get_instruments(exchange).await)?;
        }

        let ttl = if records.is_empty() {
            self.last_fallback.store(true, Ordering::Relaxed);
            self.fallback_events.fetch_add(1, Ordering::Relaxed);
            self.fallback_log
                .warn("instrument universe empty after retry, caching under short TTL");
            Duration::from_secs(self.config.instrument_empty_ttl_seconds.max(1))
        } else {
            self.last_fallback.store(false, Ordering::Relaxed);
            Duration::from_secs(self.config.instrument_cache_ttl_seconds.max(1))
        };

        let records = Arc::new(records);
        self.instrument_cache.write().insert(
            exchange.to_string(),
            InstrumentCacheEntry {
                fetched_at: Instant::now(),
                ttl,
                records: records.clone(),
            },
        );
        debug!(exchange, count = records.len(), "instrument universe refreshed");
        Ok(records)
    }

    fn cached_instruments(&self, exchange: &str) -> Option<Arc<Vec<InstrumentRecord>>> {
        let cache = self.instrument_cache.read();
        let entry = cache.get(exchange)?;
        if entry.fetched_at.elapsed() < entry.ttl {
            Some(entry.records.clone())
        } else {
            None
        }
    }

    // -------------------------------------------------------------------------
    // Expiries
    // -------------------------------------------------------------------------

    /// Expiry catalogue for one index with derived subsets. When the backend
    /// catalogue is empty but an instrument universe exists, two near
    /// Thursdays are fabricated so collection can proceed.
    pub async fn resolve_expiries(&self, index: &str) -> Result<ResolvedExpiries, ProviderError> {
        self.limiter.acquire().await;
        let dates = match self.classify(self.backend.resolve_expiries(index).await) {
            Ok(dates) => dates,
            Err(ProviderError::ResolveExpiry { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        if !dates.is_empty() {
            return Ok(ResolvedExpiries::derive(dates, false));
        }

        // No catalogue. Fabricate only when an instrument universe exists.
        let universe = self.get_instruments(&self.config.exchange, false).await?;
        if universe.is_empty() {
            return Err(ProviderError::ResolveExpiry {
                index: index.to_string(),
                reason: "no expiries and no instrument universe".to_string(),
            });
        }

        let today = chrono::Utc::now().date_naive();
        let fabricated = market_hours::near_thursdays(today, 2);
        self.fallback_events.fetch_add(1, Ordering::Relaxed);
        self.fallback_log.warn("expiry catalogue empty, fabricating near-Thursday expiries");
        Ok(ResolvedExpiries::derive(fabricated, true))
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    /// Quotes for a set of instruments, served from the quote cache where
    /// fresh. An empty domain response maps to `NoQuotes`.
    pub async fn get_quotes(
        &self,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, QuoteRecord>, ProviderError> {
        if instrument_ids.is_empty() {
            return Err(ProviderError::NoQuotes(0));
        }

        let ttl = self.config.quote_cache_ttl_seconds;
        let mut result = HashMap::new();
        let mut missing: Vec<String> = Vec::new();

        if ttl > 0.0 {
            let cache = self.quote_cache.read();
            for id in instrument_ids {
                match cache.get(id) {
                    Some(entry) if entry.fetched_at.elapsed().as_secs_f64() < ttl => {
                        result.insert(id.clone(), entry.quote.clone());
                    }
                    _ => missing.push(id.clone()),
                }
            }
            self.cache_hits.fetch_add(result.len() as u64, Ordering::Relaxed);
            self.cache_misses.fetch_add(missing.len() as u64, Ordering::Relaxed);
        } else {
            missing = instrument_ids.to_vec();
        }

        if !missing.is_empty() {
            self.limiter.acquire().await;
            match self.classify(self.backend.get_quotes(&missing).await) {
                Ok(fresh) => {
                    if ttl > 0.0 {
                        let mut cache = self.quote_cache.write();
                        for (id, quote) in &fresh {
                            cache.insert(
                                id.clone(),
                                QuoteCacheEntry {
                                    fetched_at: Instant::now(),
                                    quote: quote.clone(),
                                },
                            );
                        }
                    }
                    result.extend(fresh);
                }
                Err(ProviderError::NoQuotes(_)) if !result.is_empty() => {
                    // Cached quotes still satisfy part of the request.
                    self.quote_fallback_events.fetch_add(1, Ordering::Relaxed);
                    self.quote_fallback_log
                        .warn("quote domain empty, serving cached quotes only");
                }
                Err(e) => return Err(e),
            }
        }

        if result.is_empty() {
            self.quote_fallback_events.fetch_add(1, Ordering::Relaxed);
            self.quote_fallback_log.warn("quote domain returned no quotes");
            return Err(ProviderError::NoQuotes(instrument_ids.len()));
        }
        Ok(result)
    }

    /// Last prices with a quality guard rejecting non-positive values.
    pub async fn get_ltp(
        &self,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, f64>, ProviderError> {
        self.limiter.acquire().await;
        let raw = self.classify(self.backend.get_ltp(instrument_ids).await)?;
        let filtered: HashMap<String, f64> =
            raw.into_iter().filter(|(_, p)| *p > 0.0).collect();
        if filtered.is_empty() {
            return Err(ProviderError::NoQuotes(instrument_ids.len()));
        }
        Ok(filtered)
    }

    // -------------------------------------------------------------------------
    // ATM
    // -------------------------------------------------------------------------

    /// Strike ladder step for an index. Defaults: 100 above a 20000 spot,
    /// 50 below; per-index overrides win.
    pub fn strike_step(&self, index: &str, last_price: f64) -> f64 {
        self.config
            .strike_steps
            .get(index)
            .copied()
            .unwrap_or(if last_price > 20_000.0 { 100.0 } else { 50.0 })
    }

    /// Nearest listed strike to `last_price`. Never fails.
    pub fn get_atm_strike(&self, index: &str, last_price: f64) -> f64 {
        let step = self.strike_step(index, last_price);
        if step <= 0.0 || !last_price.is_finite() {
            return last_price.round();
        }
        (last_price / step).round() * step
    }

    // -------------------------------------------------------------------------
    // Diagnostics / health
    // -------------------------------------------------------------------------

    pub fn diagnostics(&self) -> ProviderDiagnostics {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let ratio = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };
        let creds = self.credentials();
        ProviderDiagnostics {
            provider: self.backend.name().to_string(),
            instrument_cache_size: self.instrument_cache.read().len(),
            quote_cache_size: self.quote_cache.read().len(),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_ratio: ratio,
            fallback_events: self.fallback_events.load(Ordering::Relaxed),
            quote_fallback_events: self.quote_fallback_events.load(Ordering::Relaxed),
            token_age_seconds: creds.age_seconds(),
            credentials_complete: creds.complete,
            last_fallback: self.last_fallback.load(Ordering::Relaxed),
            health: self.local_health(),
        }
    }

    /// Facade-local health view (no upstream round trip).
    fn local_health(&self) -> HealthStatus {
        if self.auth_failed.load(Ordering::Relaxed) {
            return HealthStatus::Unhealthy("auth failure".to_string());
        }
        if !self.credentials().complete {
            return HealthStatus::Degraded("credentials incomplete".to_string());
        }
        if self.last_fallback.load(Ordering::Relaxed) {
            return HealthStatus::Degraded("last instrument fetch fell back".to_string());
        }
        HealthStatus::Healthy
    }

    /// Combined facade + backend health.
    pub async fn health(&self) -> HealthStatus {
        match self.local_health() {
            HealthStatus::Healthy => self.backend.health().await,
            other => other,
        }
    }

    // -------------------------------------------------------------------------
    // Internal
    // -------------------------------------------------------------------------

    /// Record auth failures so health flips to unhealthy.
    fn classify<T>(&self, result: Result<T, ProviderError>) -> Result<T, ProviderError> {
        if let Err(ProviderError::Auth(_)) = &result {
            self.auth_failed.store(true, Ordering::Relaxed);
        }
        result
    }
}
