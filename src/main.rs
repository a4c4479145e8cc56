// =============================================================================
// G6 Collector — Main Entry Point
// =============================================================================
//
// Wires the subsystems together and supervises the background tasks: the
// cycle orchestrator, the status/metrics HTTP server, the heartbeat, the
// cardinality guard, the panel integrity monitor, and the lifecycle
// janitor. Shutdown drains in-flight work, closes the metric batcher, and
// flushes sinks before exiting.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use g6_collector::api::{self, ApiState};
use g6_collector::config::CollectorConfig;
use g6_collector::lifecycle::LifecycleJanitor;
use g6_collector::metrics::{CardinalityGuard, CounterBatcher, MetricsHandles, MetricsRegistry};
use g6_collector::orchestrator::Orchestrator;
use g6_collector::panels;
use g6_collector::provider::facade::CredentialsSnapshot;
use g6_collector::provider::sim::SimBackend;
use g6_collector::provider::upstream::UpstreamBackend;
use g6_collector::provider::{ProviderFacade, ProviderRegistry};
use g6_collector::sinks::{CsvSink, OptionSink};
use g6_collector::state::CollectorState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("G6 Collector starting up");

    let config_path =
        std::env::var("G6_CONFIG").unwrap_or_else(|_| "collector_config.json".to_string());
    let mut config = CollectorConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        CollectorConfig::default()
    });

    // Override the index list from the environment if present.
    if let Ok(indices) = std::env::var("G6_INDICES") {
        let wanted: Vec<String> = indices
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !wanted.is_empty() {
            for params in config.index_params.values_mut() {
                params.enable = false;
            }
            for index in wanted {
                config.index_params.entry(index).or_default().enable = true;
            }
        }
    }
    if let Ok(addr) = std::env::var("G6_BIND_ADDR") {
        config.metrics.listen_addr = addr;
    }
    let config = Arc::new(config);

    info!(
        indices = ?config.enabled_indices(),
        interval_seconds = config.collection.interval_seconds,
        gating_mode = %config.shadow_gating.mode,
        "collector configured"
    );

    // ── 2. Metrics registry, handles, batcher ────────────────────────────
    let registry = Arc::new(MetricsRegistry::new(config.metrics.clone()));
    let metrics = MetricsHandles::build(&registry)?;
    let (batcher, batcher_worker) =
        CounterBatcher::spawn(config.metrics.batch.clone(), metrics.clone());

    // ── 3. Provider registry & facade ────────────────────────────────────
    let credentials = CredentialsSnapshot::from_env();
    let provider_registry = ProviderRegistry::new();
    provider_registry.register(Arc::new(SimBackend::nifty_fixture()));
    if credentials.complete {
        let base_url = std::env::var("G6_UPSTREAM_URL")
            .unwrap_or_else(|_| "https://api.upstream.example".to_string());
        provider_registry.register(Arc::new(UpstreamBackend::new(
            credentials.api_key.clone(),
            credentials.access_token.clone(),
            base_url,
        )));
    } else {
        warn!("credentials incomplete, running on the sim provider only");
    }

    let backend = provider_registry.select(None, Some(&config.provider.default_provider))?;
    let provider = Arc::new(ProviderFacade::new(
        backend,
        config.provider.clone(),
        credentials,
    ));
    let provider_names: Vec<String> = provider_registry.capabilities().into_keys().collect();

    // ── 4. Shared state & sinks ──────────────────────────────────────────
    let state = Arc::new(CollectorState::new(config.clone()));
    let sinks: Vec<Arc<dyn OptionSink>> = vec![Arc::new(CsvSink::new(&config.storage.csv_dir))];

    // ── 5. Status / metrics HTTP server ──────────────────────────────────
    let api_state = ApiState {
        collector: state.clone(),
        registry: registry.clone(),
        provider: provider.clone(),
    };
    let bind_addr = config.metrics.listen_addr.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind status server");
                return;
            }
        };
        info!(addr = %bind_addr, "status server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "status server failed");
        }
    });

    // ── 6. Heartbeat (independent of market hours) ───────────────────────
    let hb_metrics = metrics.clone();
    let hb_state = state.clone();
    let hb_interval = config.collection.heartbeat_interval_seconds.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(hb_interval));
        loop {
            ticker.tick().await;
            hb_metrics
                .heartbeat_timestamp
                .set(&[], chrono::Utc::now().timestamp() as f64);
            hb_metrics
                .uptime_seconds
                .set(&[], hb_state.start_time.elapsed().as_secs_f64());
        }
    });

    // ── 7. Cardinality guard & panel integrity monitor ───────────────────
    let guard = Arc::new(CardinalityGuard::new(
        registry.clone(),
        metrics.clone(),
        &config.metrics,
    ));
    let guard_interval = config.metrics.guard_interval_seconds.max(1);
    let guard_task = guard.clone();
    let integrity_metrics = metrics.clone();
    let panels_dir = std::path::PathBuf::from(&config.storage.panels_dir);
    let strict = config.metrics.strict_exceptions;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(guard_interval));
        loop {
            ticker.tick().await;
            guard_task.run_once();
            panels::integrity_sweep(&panels_dir, &integrity_metrics, strict);
        }
    });

    // ── 8. Lifecycle janitor ─────────────────────────────────────────────
    let janitor = LifecycleJanitor::new(
        &config.storage.csv_dir,
        config.lifecycle.clone(),
        metrics.clone(),
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            janitor.sweep();
        }
    });

    // ── 9. Orchestrator ──────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::new(
        config.clone(),
        state.clone(),
        provider.clone(),
        metrics.clone(),
        batcher.clone(),
        sinks,
        provider_names,
        shutdown_rx,
    );
    let orchestrator_task = tokio::spawn(orchestrator.run());

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(config.collection.shutdown_timeout_seconds.max(1));
    if tokio::time::timeout(grace, orchestrator_task).await.is_err() {
        warn!("orchestrator did not stop within the shutdown timeout");
    }

    // Drain and stop the metric batcher.
    batcher.close();
    if let Some(worker) = batcher_worker {
        if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
            warn!("batcher worker did not drain in time");
        }
    }

    info!("G6 Collector shut down complete.");
    Ok(())
}
