// =============================================================================
// Provider layer — uniform, classified access to upstream brokers
// =============================================================================
//
// A provider backend implements the raw upstream calls (instruments,
// expiries, quotes). The facade wraps a backend with caching, rate limiting,
// throttled fallback logging, and credential snapshots, and is the only
// surface the pipeline phases ever see.
// =============================================================================

pub mod errors;
pub mod facade;
pub mod registry;
pub mod sim;
pub mod upstream;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

pub use errors::ProviderError;
pub use facade::{CredentialsSnapshot, ProviderDiagnostics, ProviderFacade, ResolvedExpiries};
pub use registry::ProviderRegistry;

use crate::types::{InstrumentRecord, QuoteRecord};

/// Capability flags a backend declares at registration.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Capabilities {
    pub quotes: bool,
    pub ltp: bool,
    pub options: bool,
    pub instruments: bool,
    pub expiries: bool,
}

impl Capabilities {
    pub fn full() -> Self {
        Self {
            quotes: true,
            ltp: true,
            options: true,
            instruments: true,
            expiries: true,
        }
    }
}

/// Coarse health classification surfaced to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

/// Raw upstream access. All errors must already be mapped into the public
/// [`ProviderError`] taxonomy by the implementation.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Full instrument universe for an exchange segment. An empty vector is
    /// a legal recoverable response, not an error.
    async fn get_instruments(&self, exchange: &str)
        -> Result<Vec<InstrumentRecord>, ProviderError>;

    /// Raw expiry catalogue for one index, ascending.
    async fn resolve_expiries(&self, index: &str) -> Result<Vec<NaiveDate>, ProviderError>;

    async fn get_quotes(
        &self,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, QuoteRecord>, ProviderError>;

    async fn get_ltp(
        &self,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, f64>, ProviderError>;

    async fn health(&self) -> HealthStatus;
}
