// =============================================================================
// Provider error taxonomy
// =============================================================================
//
// Every failure leaving the provider layer is one of these classified
// variants. The pipeline executor maps them onto phase outcomes: auth errors
// are never retried, resolve failures abort the expiry, empty domains are
// recoverable, transients are retryable.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credentials invalid or expired. Not retried by the executor.
    #[error("provider auth failed: {0}")]
    Auth(String),

    /// Expiry resolution failed; maps to a pipeline abort.
    #[error("expiry resolution failed for {index}: {reason}")]
    ResolveExpiry { index: String, reason: String },

    /// Empty instrument domain after the one-shot retry.
    #[error("no instruments for {0}")]
    NoInstruments(String),

    /// Domain returned no quotes.
    #[error("no quotes for {0} instruments")]
    NoQuotes(usize),

    /// Generic retryable condition (timeout, 5xx, connection reset).
    #[error("transient provider failure: {0}")]
    Transient(String),
}

impl ProviderError {
    /// Stable short token used in structured error details.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::ResolveExpiry { .. } => "resolve_expiry",
            Self::NoInstruments(_) => "no_instruments",
            Self::NoQuotes(_) => "no_quotes",
            Self::Transient(_) => "transient",
        }
    }

    /// Whether the executor may retry the phase that saw this error.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::NoInstruments(_) | Self::NoQuotes(_) | Self::Transient(_)
        )
    }
}
