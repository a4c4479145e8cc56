// =============================================================================
// Pipeline — phased processing of one expiry per ExpiryState
// =============================================================================
//
// The executor drives an ordered phase list over an ExpiryState, mapping
// taxonomy errors to outcomes, applying the optional retry policy, and
// emitting per-phase metrics and structured error records. Phases live in
// `phases/`; each is replay-safe with respect to fields it already set.
// =============================================================================

pub mod error;
pub mod executor;
pub mod phases;
pub mod state;
pub mod summary;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::watch;

use crate::config::CollectorConfig;
use crate::events::StructuredEvent;
use crate::metrics::{BatcherHandle, MetricsHandles};
use crate::provider::ProviderFacade;
use crate::sinks::OptionSink;

pub use error::{PhaseError, PhaseOutcome};
pub use executor::{PipelineExecutor, PipelineRunResult};
pub use state::{ExpiryState, PhaseErrorRecord};
pub use summary::PipelineSummary;

/// Sink for structured events; the orchestrator routes them into the state
/// ring and tracing.
pub type EventSink = Arc<dyn Fn(StructuredEvent) + Send + Sync>;

/// Per-cycle context handed to every phase. Cheap to clone per expiry.
#[derive(Clone)]
pub struct PhaseContext {
    pub config: Arc<CollectorConfig>,
    pub provider: Arc<ProviderFacade>,
    pub metrics: MetricsHandles,
    pub batcher: BatcherHandle,
    pub sinks: Arc<Vec<Arc<dyn OptionSink>>>,
    pub emit: EventSink,
    /// Registered provider names, used for error-record enrichment.
    pub provider_names: Vec<String>,
    /// Compiled redaction patterns applied to structured record messages
    /// (never to the legacy token stream).
    pub redactors: Arc<Vec<regex::Regex>>,
    /// Collection date the cycle runs against.
    pub today: NaiveDate,
    /// Epoch seconds stamped on this cycle's artifacts.
    pub cycle_ts: i64,
    /// Flips to true when the orchestrator cancels the cycle.
    pub cancel: watch::Receiver<bool>,
}

impl PhaseContext {
    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// One step of the pipeline. Phases are single-threaded per ExpiryState; no
/// intra-phase locking is required.
#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &PhaseContext, state: &mut ExpiryState) -> Result<(), PhaseError>;
}

// =============================================================================
// Test support
// =============================================================================
#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::metrics::{CounterBatcher, MetricsRegistry};
    use crate::provider::facade::CredentialsSnapshot;
    use crate::provider::sim::SimBackend;
    use crate::sinks::MemSink;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Failure script for a [`ScriptedPhase`].
    pub enum FailPlan {
        /// Succeed on every attempt.
        Never,
        /// Return this error on every attempt.
        Always(PhaseError),
        /// Fail the first n attempts with a recoverable error, then succeed.
        FailFirst(u32),
    }

    /// A phase whose behaviour is fully scripted, for executor tests.
    pub struct ScriptedPhase {
        name: &'static str,
        plan: FailPlan,
        calls: AtomicU32,
    }

    impl ScriptedPhase {
        pub fn ok(name: &'static str) -> Self {
            Self {
                name,
                plan: FailPlan::Never,
                calls: AtomicU32::new(0),
            }
        }

        pub fn failing(name: &'static str, plan: FailPlan) -> Self {
            Self {
                name,
                plan,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Phase for ScriptedPhase {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(
            &self,
            _ctx: &PhaseContext,
            _state: &mut ExpiryState,
        ) -> Result<(), PhaseError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            match &self.plan {
                FailPlan::Never => Ok(()),
                FailPlan::Always(err) => Err(err.clone()),
                FailPlan::FailFirst(n) => {
                    if call < *n {
                        Err(PhaseError::recoverable("no_instruments_domain"))
                    } else {
                        Ok(())
                    }
                }
            }
        }
    }

    /// Everything a test needs to observe a pipeline run.
    pub struct TestEnv {
        pub metrics: MetricsHandles,
        pub registry: Arc<MetricsRegistry>,
        pub mem_sink: Arc<MemSink>,
        pub events: Arc<Mutex<Vec<StructuredEvent>>>,
        pub cancel_tx: tokio::sync::watch::Sender<bool>,
    }

    /// Build a PhaseContext over the sim backend with batching disabled so
    /// metric assertions see increments immediately.
    pub fn test_context(
        mutate: impl FnOnce(&mut CollectorConfig),
    ) -> (PhaseContext, TestEnv) {
        test_context_with_backend(SimBackend::nifty_fixture(), vec![Arc::new(MemSink::new())], mutate)
    }

    /// Like [`test_context`] but with a custom backend and sink list. The
    /// first MemSink in `sinks` (if any) is exposed on the returned env.
    pub fn test_context_with_backend(
        backend: SimBackend,
        sinks: Vec<Arc<MemSink>>,
        mutate: impl FnOnce(&mut CollectorConfig),
    ) -> (PhaseContext, TestEnv) {
        let mut config = CollectorConfig::default();
        config.metrics.batch.enabled = false;
        mutate(&mut config);

        let registry = Arc::new(MetricsRegistry::new(MetricsConfig::default()));
        let metrics = crate::metrics::MetricsHandles::build(&registry).unwrap();
        let (batcher, _worker) =
            CounterBatcher::spawn(config.metrics.batch.clone(), metrics.clone());

        let provider = Arc::new(ProviderFacade::new(
            Arc::new(backend),
            config.provider.clone(),
            CredentialsSnapshot {
                api_key: "k".into(),
                access_token: "t".into(),
                source: "manual".into(),
                created_at: chrono::Utc::now().timestamp(),
                discovered: true,
                complete: true,
            },
        ));

        let redactors: Vec<regex::Regex> = config
            .pipeline
            .redact_patterns
            .iter()
            .filter_map(|p| regex::Regex::new(p).ok())
            .collect();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_for_emit = events.clone();
        let emit: EventSink = Arc::new(move |ev: StructuredEvent| {
            events_for_emit.lock().push(ev);
        });

        let mem_sink = sinks
            .first()
            .cloned()
            .unwrap_or_else(|| Arc::new(MemSink::new()));
        let sink_objects: Vec<Arc<dyn crate::sinks::OptionSink>> = sinks
            .into_iter()
            .map(|s| s as Arc<dyn crate::sinks::OptionSink>)
            .collect();

        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

        let ctx = PhaseContext {
            config: Arc::new(config),
            provider,
            metrics: metrics.clone(),
            batcher,
            sinks: Arc::new(sink_objects),
            emit,
            provider_names: vec!["sim".to_string()],
            redactors: Arc::new(redactors),
            today: chrono::Utc::now().date_naive(),
            cycle_ts: chrono::Utc::now().timestamp(),
            cancel: cancel_rx,
        };

        (
            ctx,
            TestEnv {
                metrics,
                registry,
                mem_sink,
                events,
                cancel_tx,
            },
        )
    }
}
