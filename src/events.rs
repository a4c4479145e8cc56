// =============================================================================
// Structured Events — auditable record of pipeline and cycle milestones
// =============================================================================
//
// Every notable transition (expiry completion, phase failure, index failure,
// cycle timeout, parity anomaly) is captured as a StructuredEvent. Events are
// logged through tracing at emission time and retained in the collector
// state's ring buffer for the status API.
// =============================================================================

use serde::Serialize;
use tracing::{info, warn};

/// A single structured event. `kind` uses dotted lowercase tokens such as
/// `expiry.complete`, `expiry.fetch.recoverable`, `cycle.timeout`,
/// `index.failed`, `alert_parity.anomaly`.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredEvent {
    /// Unique identifier for this event (UUID v4).
    pub id: String,

    /// Dotted event kind token.
    pub kind: String,

    /// Index the event pertains to, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    /// Expiry rule token, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    /// Free-form payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,

    /// ISO 8601 timestamp of when this event was created.
    pub created_at: String,
}

impl StructuredEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            index: None,
            rule: None,
            detail: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Log the event through tracing. Error-ish kinds go to warn.
    pub fn log(&self) {
        let alerting = self.kind.contains("failed")
            || self.kind.contains("timeout")
            || self.kind.contains("anomaly")
            || self.kind.contains("fatal");
        if alerting {
            warn!(
                kind = %self.kind,
                index = self.index.as_deref().unwrap_or("-"),
                rule = self.rule.as_deref().unwrap_or("-"),
                "structured event"
            );
        } else {
            info!(
                kind = %self.kind,
                index = self.index.as_deref().unwrap_or("-"),
                rule = self.rule.as_deref().unwrap_or("-"),
                "structured event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let ev = StructuredEvent::new("expiry.complete")
            .with_index("NIFTY")
            .with_rule("this_week")
            .with_detail(serde_json::json!({"phases_ok": 13}));
        assert_eq!(ev.kind, "expiry.complete");
        assert_eq!(ev.index.as_deref(), Some("NIFTY"));
        assert_eq!(ev.rule.as_deref(), Some("this_week"));
        assert!(ev.detail.is_some());
        assert!(!ev.id.is_empty());
    }

    #[test]
    fn serialises_without_empty_optionals() {
        let ev = StructuredEvent::new("cycle.timeout");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("\"index\""));
        assert!(!json.contains("\"rule\""));
        assert!(json.contains("cycle.timeout"));
    }
}
