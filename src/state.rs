// =============================================================================
// Central Collector State
// =============================================================================
//
// The single source of truth for the status API. Subsystems own their own
// state; CollectorState ties the operational view together and provides a
// unified snapshot.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::CollectorConfig;
use crate::events::StructuredEvent;
use crate::parity::GatingDecision;
use crate::provider::ProviderDiagnostics;
use crate::types::OverviewSnapshot;

/// Maximum number of recent structured events to retain.
const MAX_RECENT_EVENTS: usize = 100;
/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded operational error for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central operational state shared across tasks via `Arc<CollectorState>`.
pub struct CollectorState {
    /// Monotonically increasing version counter, incremented on every
    /// meaningful state mutation.
    pub state_version: AtomicU64,

    pub config: Arc<CollectorConfig>,

    pub recent_events: RwLock<Vec<StructuredEvent>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Last overview per index.
    pub last_overviews: RwLock<HashMap<String, OverviewSnapshot>>,
    /// Latest shadow gating decision, when shadow mode runs.
    pub last_gating: RwLock<Option<GatingDecision>>,

    pub last_cycle_ts: RwLock<Option<i64>>,
    pub last_cycle_success: RwLock<Option<bool>>,
    pub cycles_completed: AtomicU64,

    pub start_time: std::time::Instant,
}

impl CollectorState {
    pub fn new(config: Arc<CollectorConfig>) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config,
            recent_events: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            last_overviews: RwLock::new(HashMap::new()),
            last_gating: RwLock::new(None),
            last_cycle_ts: RwLock::new(None),
            last_cycle_success: RwLock::new(None),
            cycles_completed: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Rings ───────────────────────────────────────────────────────────

    /// Record a structured event. The ring is capped at
    /// [`MAX_RECENT_EVENTS`]; oldest entries are evicted.
    pub fn push_event(&self, event: StructuredEvent) {
        let mut events = self.recent_events.write();
        events.push(event);
        while events.len() > MAX_RECENT_EVENTS {
            events.remove(0);
        }
        drop(events);
        self.increment_version();
    }

    pub fn push_error(&self, message: String, code: Option<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    // ── Cycle bookkeeping ───────────────────────────────────────────────

    pub fn record_cycle(&self, ts: i64, success: bool) {
        *self.last_cycle_ts.write() = Some(ts);
        *self.last_cycle_success.write() = Some(success);
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.increment_version();
    }

    pub fn set_overview(&self, index: &str, overview: OverviewSnapshot) {
        self.last_overviews
            .write()
            .insert(index.to_string(), overview);
        self.increment_version();
    }

    pub fn set_gating(&self, decision: GatingDecision) {
        *self.last_gating.write() = Some(decision);
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build the full status payload for `GET /api/v1/state`.
    pub fn build_snapshot(
        &self,
        market_open: bool,
        provider: Option<ProviderDiagnostics>,
    ) -> CollectorSnapshot {
        let now = Utc::now();
        let last_cycle_ts = *self.last_cycle_ts.read();

        let truth = TruthHeader {
            market_open,
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            last_cycle_age_s: last_cycle_ts.map(|ts| (now.timestamp() - ts).max(0)),
            last_cycle_success: *self.last_cycle_success.read(),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            gating_mode: self.config.shadow_gating.mode.to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        };

        CollectorSnapshot {
            state_version: truth.state_version,
            server_time: truth.server_time,
            truth,
            overviews: self.last_overviews.read().clone(),
            gating: self.last_gating.read().clone(),
            provider,
            recent_events: self.recent_events.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            indices: self.config.enabled_indices(),
            interval_seconds: self.config.collection.interval_seconds,
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Operational truth header for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct TruthHeader {
    pub market_open: bool,
    pub state_version: u64,
    pub server_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_age_s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_success: Option<bool>,
    pub cycles_completed: u64,
    pub gating_mode: String,
    pub uptime_seconds: u64,
}

/// Full collector snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub truth: TruthHeader,
    pub overviews: HashMap<String, OverviewSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gating: Option<GatingDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderDiagnostics>,
    pub recent_events: Vec<StructuredEvent>,
    pub recent_errors: Vec<ErrorRecord>,
    pub indices: Vec<String>,
    pub interval_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CollectorState {
        CollectorState::new(Arc::new(CollectorConfig::default()))
    }

    #[test]
    fn event_ring_caps_at_limit() {
        let st = state();
        for i in 0..(MAX_RECENT_EVENTS + 10) {
            st.push_event(StructuredEvent::new(format!("ev.{i}")));
        }
        let events = st.recent_events.read();
        assert_eq!(events.len(), MAX_RECENT_EVENTS);
        // Oldest evicted, newest retained.
        assert_eq!(events.last().unwrap().kind, format!("ev.{}", MAX_RECENT_EVENTS + 9));
    }

    #[test]
    fn version_increments_on_mutation() {
        let st = state();
        let v0 = st.current_state_version();
        st.push_error("boom".to_string(), None);
        st.record_cycle(1_722_500_000, true);
        assert!(st.current_state_version() >= v0 + 2);
    }

    #[test]
    fn snapshot_reflects_cycle_state() {
        let st = state();
        st.record_cycle(Utc::now().timestamp(), true);
        st.set_overview("NIFTY", OverviewSnapshot::default());

        let snap = st.build_snapshot(true, None);
        assert!(snap.truth.market_open);
        assert_eq!(snap.truth.last_cycle_success, Some(true));
        assert_eq!(snap.truth.cycles_completed, 1);
        assert!(snap.overviews.contains_key("NIFTY"));
        assert!(snap.indices.contains(&"NIFTY".to_string()));
    }
}
