// =============================================================================
// Counter Batcher — single-writer aggregation for hot-path increments
// =============================================================================
//
// Producers enqueue increments onto a bounded channel; one background worker
// aggregates them keyed by (metric, label tuple) and applies them on flush.
// Flush fires on whichever comes first: the configured interval, the
// distinct-key threshold, or the adaptive increment target (an EWMA of
// increments/sec clamped between min and max batch size). An explicit Flush
// message forces one; Close drains synchronously and stops the worker.
//
// Backpressure: queue depth above the shed watermark drops increments (they
// are counted, never silently lost); a full channel falls through to
// immediate emission so correctness never depends on the worker.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::BatchConfig;

use super::registry::{Counter, MetricsHandles};

/// Channel capacity. The shed watermark sits below this so producers start
/// dropping before the channel itself fills.
const QUEUE_CAPACITY: usize = 4096;
const SHED_WATERMARK: i64 = (QUEUE_CAPACITY as i64 * 9) / 10;

/// EWMA smoothing for the increments/sec estimate.
const EWMA_ALPHA: f64 = 0.3;

enum BatchMsg {
    Inc {
        counter: Counter,
        labels: Vec<String>,
        amount: f64,
    },
    Flush,
    Close,
}

/// Producer-side handle. Cheap to clone; safe to use from any task.
#[derive(Clone)]
pub struct BatcherHandle {
    tx: Option<mpsc::Sender<BatchMsg>>,
    depth: Arc<AtomicI64>,
    metrics: MetricsHandles,
}

impl BatcherHandle {
    /// Route one increment through the batcher. Falls through to immediate
    /// emission when batching is disabled or the queue is full; drops (and
    /// counts) the increment in shed mode.
    pub fn inc(&self, counter: &Counter, labels: &[&str], amount: f64) {
        let Some(tx) = &self.tx else {
            counter.inc_by(labels, amount);
            return;
        };

        if self.depth.load(Ordering::Relaxed) >= SHED_WATERMARK {
            self.metrics.batch_shed.inc(&[]);
            return;
        }

        let msg = BatchMsg::Inc {
            counter: counter.clone(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            amount,
        };
        match tx.try_send(msg) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => counter.inc_by(labels, amount),
        }
    }

    /// Request an early flush. Fire-and-forget.
    pub fn flush(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(BatchMsg::Flush);
        }
    }

    /// Ask the worker to drain and stop. The caller should await the join
    /// handle returned by [`CounterBatcher::spawn`] afterwards.
    pub fn close(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(BatchMsg::Close);
        }
    }

    pub fn enabled(&self) -> bool {
        self.tx.is_some()
    }
}

/// The background aggregation worker.
pub struct CounterBatcher;

impl CounterBatcher {
    /// Spawn the worker. With batching disabled the handle simply forwards
    /// every increment and no worker runs.
    pub fn spawn(
        config: BatchConfig,
        metrics: MetricsHandles,
    ) -> (BatcherHandle, Option<tokio::task::JoinHandle<()>>) {
        if !config.enabled {
            return (
                BatcherHandle {
                    tx: None,
                    depth: Arc::new(AtomicI64::new(0)),
                    metrics,
                },
                None,
            );
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let depth = Arc::new(AtomicI64::new(0));
        let handle = BatcherHandle {
            tx: Some(tx),
            depth: depth.clone(),
            metrics: metrics.clone(),
        };
        let worker = tokio::spawn(Self::run(config, rx, depth, metrics));
        (handle, Some(worker))
    }

    async fn run(
        config: BatchConfig,
        mut rx: mpsc::Receiver<BatchMsg>,
        depth: Arc<AtomicI64>,
        metrics: MetricsHandles,
    ) {
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Pending increments keyed by (metric identity, label tuple).
        let mut pending: HashMap<(usize, Vec<String>), (Counter, f64)> = HashMap::new();
        let mut pending_increments = 0usize;
        let mut ewma_rate = 0.0_f64;
        let mut target = config.min_size.max(1);
        let mut last_flush = Instant::now();

        info!(
            interval_ms = config.interval_ms,
            flush_threshold = config.flush_threshold,
            "counter batcher started"
        );

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(BatchMsg::Inc { counter, labels, amount }) => {
                            depth.fetch_sub(1, Ordering::Relaxed);
                            let key = (Arc::as_ptr(counter.core()) as usize, labels);
                            pending
                                .entry(key)
                                .and_modify(|(_, total)| *total += amount)
                                .or_insert((counter, amount));
                            pending_increments += 1;

                            if pending.len() >= config.flush_threshold.max(1)
                                || pending_increments >= target
                            {
                                Self::flush(
                                    &mut pending,
                                    &mut pending_increments,
                                    &mut ewma_rate,
                                    &mut target,
                                    &mut last_flush,
                                    &config,
                                    &metrics,
                                );
                            }
                        }
                        Some(BatchMsg::Flush) => {
                            Self::flush(
                                &mut pending,
                                &mut pending_increments,
                                &mut ewma_rate,
                                &mut target,
                                &mut last_flush,
                                &config,
                                &metrics,
                            );
                        }
                        Some(BatchMsg::Close) | None => {
                            Self::flush(
                                &mut pending,
                                &mut pending_increments,
                                &mut ewma_rate,
                                &mut target,
                                &mut last_flush,
                                &config,
                                &metrics,
                            );
                            info!("counter batcher drained and stopped");
                            return;
                        }
                    }
                    metrics
                        .batch_queue_depth
                        .set(&[], depth.load(Ordering::Relaxed).max(0) as f64);
                }
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        Self::flush(
                            &mut pending,
                            &mut pending_increments,
                            &mut ewma_rate,
                            &mut target,
                            &mut last_flush,
                            &config,
                            &metrics,
                        );
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn flush(
        pending: &mut HashMap<(usize, Vec<String>), (Counter, f64)>,
        pending_increments: &mut usize,
        ewma_rate: &mut f64,
        target: &mut usize,
        last_flush: &mut Instant,
        config: &BatchConfig,
        metrics: &MetricsHandles,
    ) {
        let started = Instant::now();
        let applied = *pending_increments;

        for ((_, labels), (counter, total)) in pending.drain() {
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            counter.inc_by(&refs, total);
        }

        // Adaptive target: EWMA of increments/sec scaled to the interval,
        // clamped into [min_size, max_size].
        let elapsed = last_flush.elapsed().as_secs_f64().max(1e-6);
        let rate = applied as f64 / elapsed;
        *ewma_rate = if *ewma_rate == 0.0 {
            rate
        } else {
            EWMA_ALPHA * rate + (1.0 - EWMA_ALPHA) * *ewma_rate
        };
        let interval_secs = config.interval_ms.max(1) as f64 / 1000.0;
        *target = ((*ewma_rate * interval_secs) as usize)
            .clamp(config.min_size.max(1), config.max_size.max(1));

        *pending_increments = 0;
        *last_flush = Instant::now();

        metrics
            .batch_flush_duration
            .observe(&[], started.elapsed().as_secs_f64());
        metrics.batch_flush_increments.set(&[], applied as f64);
        metrics.batch_adaptive_target.set(&[], *target as f64);

        debug!(applied, target = *target, "batcher flush");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::metrics::registry::MetricsRegistry;

    fn handles() -> MetricsHandles {
        let registry = MetricsRegistry::new(MetricsConfig::default());
        MetricsHandles::build(&registry).unwrap()
    }

    #[tokio::test]
    async fn disabled_batcher_emits_immediately() {
        let metrics = handles();
        let config = BatchConfig {
            enabled: false,
            ..BatchConfig::default()
        };
        let (batcher, worker) = CounterBatcher::spawn(config, metrics.clone());
        assert!(worker.is_none());
        assert!(!batcher.enabled());

        batcher.inc(&metrics.cycles_total, &[], 1.0);
        assert_eq!(metrics.cycles_total.get(&[]), 1.0);
    }

    #[tokio::test]
    async fn batched_increments_apply_on_flush() {
        let metrics = handles();
        let config = BatchConfig {
            enabled: true,
            interval_ms: 10_000, // never fires during the test
            ..BatchConfig::default()
        };
        let (batcher, worker) = CounterBatcher::spawn(config, metrics.clone());

        for _ in 0..5 {
            batcher.inc(&metrics.phase_attempts, &["fetch"], 1.0);
        }
        // Nothing applied until a flush.
        batcher.flush();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.phase_attempts.get(&["fetch"]), 5.0);

        batcher.close();
        worker.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn close_drains_pending_increments() {
        let metrics = handles();
        let config = BatchConfig {
            enabled: true,
            interval_ms: 10_000,
            ..BatchConfig::default()
        };
        let (batcher, worker) = CounterBatcher::spawn(config, metrics.clone());

        batcher.inc(&metrics.cycles_total, &[], 1.0);
        batcher.inc(&metrics.cycles_total, &[], 1.0);
        batcher.close();
        worker.unwrap().await.unwrap();

        assert_eq!(metrics.cycles_total.get(&[]), 2.0);
    }

    #[tokio::test]
    async fn distinct_key_threshold_forces_flush() {
        let metrics = handles();
        let config = BatchConfig {
            enabled: true,
            interval_ms: 10_000,
            flush_threshold: 2,
            ..BatchConfig::default()
        };
        let (batcher, worker) = CounterBatcher::spawn(config, metrics.clone());

        batcher.inc(&metrics.phase_attempts, &["fetch"], 1.0);
        batcher.inc(&metrics.phase_attempts, &["enrich"], 1.0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(metrics.phase_attempts.get(&["fetch"]), 1.0);
        assert_eq!(metrics.phase_attempts.get(&["enrich"]), 1.0);

        batcher.close();
        worker.unwrap().await.unwrap();
    }
}
