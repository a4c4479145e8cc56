// =============================================================================
// Phase error taxonomy and outcome classification
// =============================================================================
//
// Phases fail by returning a `PhaseError`; the executor maps the error (and
// the retry budget) onto a `PhaseOutcome`. Tests assert on outcomes directly
// rather than matching error values.
// =============================================================================

use thiserror::Error;

/// Classified failure raised by a phase. `message` is a stable short code
/// (no PII, no tokens); `detail` optionally carries richer context.
#[derive(Debug, Clone, Error)]
pub enum PhaseError {
    /// Structural absence making the phase meaningless. Expected; logged at
    /// INFO; never retried.
    #[error("abort: {message}")]
    Abort {
        message: String,
        detail: Option<String>,
    },

    /// External or data-level condition that might self-correct. Retried
    /// when the retry policy is enabled.
    #[error("recoverable: {message}")]
    Recoverable {
        message: String,
        detail: Option<String>,
    },

    /// Invariant violation or permanent sink failure. Marks the index
    /// failed for the cycle. Never retried.
    #[error("fatal: {message}")]
    Fatal {
        message: String,
        detail: Option<String>,
    },

    /// Anything that does not match the taxonomy. Treated as fatal for
    /// control flow, recorded with its own classification.
    #[error("unknown: {message}")]
    Unknown {
        message: String,
        trace: Option<String>,
    },
}

impl PhaseError {
    pub fn abort(message: impl Into<String>) -> Self {
        Self::Abort {
            message: message.into(),
            detail: None,
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
            detail: None,
        }
    }

    pub fn recoverable_with(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            detail: None,
        }
    }

    pub fn fatal_with(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn unknown(message: impl Into<String>, trace: Option<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            trace,
        }
    }

    /// Map a provider error to the phase taxonomy. Auth failures are fatal
    /// (never retried); empty domains and transients are recoverable.
    pub fn from_provider(err: crate::provider::ProviderError, message: &str) -> Self {
        use crate::provider::ProviderError as P;
        match err {
            P::Auth(detail) => Self::Fatal {
                message: "provider_auth".to_string(),
                detail: Some(detail),
            },
            P::ResolveExpiry { reason, .. } => Self::Abort {
                message: message.to_string(),
                detail: Some(reason),
            },
            P::NoInstruments(_) | P::NoQuotes(_) | P::Transient(_) => Self::Recoverable {
                message: message.to_string(),
                detail: Some(err.to_string()),
            },
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Abort { message, .. }
            | Self::Recoverable { message, .. }
            | Self::Fatal { message, .. }
            | Self::Unknown { message, .. } => message,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Abort { detail, .. }
            | Self::Recoverable { detail, .. }
            | Self::Fatal { detail, .. } => detail.as_deref(),
            Self::Unknown { trace, .. } => trace.as_deref(),
        }
    }
}

/// Final outcome of one phase execution sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseOutcome {
    Ok,
    Abort,
    Recoverable,
    RecoverableExhausted,
    Fatal,
    Unknown,
}

impl PhaseOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Abort => "abort",
            Self::Recoverable => "recoverable",
            Self::RecoverableExhausted => "recoverable_exhausted",
            Self::Fatal => "fatal",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Whether this outcome stops the remaining phases.
    pub fn stops_pipeline(self) -> bool {
        !self.is_ok()
    }
}

impl std::fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;

    #[test]
    fn provider_auth_maps_to_fatal() {
        let err = PhaseError::from_provider(ProviderError::Auth("expired".into()), "fetch_auth");
        assert!(matches!(err, PhaseError::Fatal { .. }));
        assert_eq!(err.message(), "provider_auth");
    }

    #[test]
    fn provider_empty_domains_map_to_recoverable() {
        let err = PhaseError::from_provider(
            ProviderError::NoInstruments("NFO".into()),
            "no_instruments_domain",
        );
        assert!(matches!(err, PhaseError::Recoverable { .. }));
        assert_eq!(err.message(), "no_instruments_domain");
    }

    #[test]
    fn outcome_tokens_are_stable() {
        assert_eq!(PhaseOutcome::RecoverableExhausted.as_str(), "recoverable_exhausted");
        assert_eq!(PhaseOutcome::Ok.as_str(), "ok");
        assert!(PhaseOutcome::Abort.stops_pipeline());
        assert!(!PhaseOutcome::Ok.stops_pipeline());
    }
}
