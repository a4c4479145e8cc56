// =============================================================================
// Upstream REST Backend — HMAC-SHA256 signed broker requests
// =============================================================================
//
// SECURITY: The secret is never logged or serialized. All signed requests
// carry the API key as a header and an HMAC-SHA256 signature of the query
// string, with a timestamp to tolerate minor clock drift.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::types::{InstrumentRecord, OptionType, QuoteRecord};

use super::{Capabilities, HealthStatus, ProviderBackend, ProviderError};

type HmacSha256 = Hmac<Sha256>;

/// Request timeout for all upstream calls.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// REST backend speaking the broker's market-data API.
pub struct UpstreamBackend {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl UpstreamBackend {
    /// Create a new backend.
    ///
    /// # Arguments
    /// * `api_key` — sent as the `X-G6-APIKEY` header, never in query params.
    /// * `secret`  — used exclusively for HMAC signing.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-G6-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Append timestamp and signature to a query string.
    fn signed_query(&self, params: &str) -> String {
        let ts = chrono::Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// GET a signed endpoint, mapping transport and status failures into the
    /// provider taxonomy.
    async fn get_json(
        &self,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ProviderError::Transient(format!("{path}: {e}"))
            } else {
                ProviderError::Transient(format!("{path}: request failed: {e}"))
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ProviderError::Auth(format!("{path} returned {status}")));
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("{path} returned {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("{path}: bad body: {e}")))?;

        if !status.is_success() {
            warn!(path, %status, "upstream request rejected");
            return Err(ProviderError::Transient(format!(
                "{path} returned {status}: {body}"
            )));
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Parse helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }

    fn parse_instrument(entry: &serde_json::Value) -> Option<InstrumentRecord> {
        let option_type = match entry.get("instrument_type")?.as_str()? {
            "CE" => OptionType::Call,
            "PE" => OptionType::Put,
            _ => return None,
        };
        Some(InstrumentRecord {
            id: entry.get("instrument_token")?.to_string(),
            symbol: entry.get("tradingsymbol")?.as_str()?.to_string(),
            root: entry.get("name")?.as_str()?.to_string(),
            strike: Self::parse_f64(entry.get("strike")?),
            option_type,
            expiry: NaiveDate::parse_from_str(entry.get("expiry")?.as_str()?, "%Y-%m-%d").ok()?,
        })
    }
}

#[async_trait]
impl ProviderBackend for UpstreamBackend {
    fn name(&self) -> &'static str {
        "upstream"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    /// GET /market/instruments — full universe for one exchange segment.
    async fn get_instruments(
        &self,
        exchange: &str,
    ) -> Result<Vec<InstrumentRecord>, ProviderError> {
        let body = self
            .get_json("/market/instruments", &format!("exchange={exchange}"))
            .await?;

        let raw = body
            .get("data")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut instruments = Vec::with_capacity(raw.len());
        for entry in &raw {
            match Self::parse_instrument(entry) {
                Some(inst) => instruments.push(inst),
                None => debug!("skipping non-option or malformed instrument entry"),
            }
        }
        debug!(exchange, count = instruments.len(), "instruments fetched");
        Ok(instruments)
    }

    /// GET /market/expiries — expiry catalogue for one index.
    async fn resolve_expiries(&self, index: &str) -> Result<Vec<NaiveDate>, ProviderError> {
        let body = self
            .get_json("/market/expiries", &format!("index={index}"))
            .await?;

        let dates: Vec<NaiveDate> = body
            .get("data")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                    .collect()
            })
            .unwrap_or_default();

        if dates.is_empty() {
            return Err(ProviderError::ResolveExpiry {
                index: index.to_string(),
                reason: "upstream catalogue empty".to_string(),
            });
        }
        Ok(dates)
    }

    /// GET /market/quotes — full quote records for a set of instruments.
    async fn get_quotes(
        &self,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, QuoteRecord>, ProviderError> {
        let body = self
            .get_json("/market/quotes", &format!("ids={}", instrument_ids.join(",")))
            .await?;

        let data = body
            .get("data")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let mut quotes = HashMap::with_capacity(data.len());
        for (id, q) in &data {
            quotes.insert(
                id.clone(),
                QuoteRecord {
                    last_price: Self::parse_f64(q.get("last_price").unwrap_or(&serde_json::Value::Null)),
                    bid: Self::parse_f64(q.get("bid").unwrap_or(&serde_json::Value::Null)),
                    ask: Self::parse_f64(q.get("ask").unwrap_or(&serde_json::Value::Null)),
                    volume: q.get("volume").and_then(|v| v.as_u64()).unwrap_or(0),
                    open_interest: q.get("oi").and_then(|v| v.as_u64()).unwrap_or(0),
                    timestamp: q
                        .get("timestamp")
                        .and_then(|v| v.as_i64())
                        .unwrap_or_else(|| chrono::Utc::now().timestamp()),
                },
            );
        }

        if quotes.is_empty() {
            return Err(ProviderError::NoQuotes(instrument_ids.len()));
        }
        debug!(requested = instrument_ids.len(), received = quotes.len(), "quotes fetched");
        Ok(quotes)
    }

    /// GET /market/ltp — last prices only.
    async fn get_ltp(
        &self,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, f64>, ProviderError> {
        let body = self
            .get_json("/market/ltp", &format!("ids={}", instrument_ids.join(",")))
            .await?;

        let data = body
            .get("data")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        Ok(data
            .iter()
            .map(|(id, v)| (id.clone(), Self::parse_f64(v)))
            .collect())
    }

    /// GET /market/status — upstream-reported health.
    async fn health(&self) -> HealthStatus {
        match self.get_json("/market/status", "").await {
            Ok(body) => match body.get("status").and_then(|v| v.as_str()) {
                Some("ok") => HealthStatus::Healthy,
                Some(other) => HealthStatus::Degraded(format!("upstream status {other}")),
                None => HealthStatus::Degraded("upstream status missing".to_string()),
            },
            Err(ProviderError::Auth(reason)) => HealthStatus::Unhealthy(reason),
            Err(e) => HealthStatus::Degraded(e.to_string()),
        }
    }
}

impl std::fmt::Debug for UpstreamBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamBackend")
            .field(
                "api_key",
                &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" },
            )
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
