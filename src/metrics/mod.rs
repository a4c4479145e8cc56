// =============================================================================
// Metrics layer — spec-driven registry with group gating and batching
// =============================================================================
//
// The full metric catalogue is declared once as data (catalogue.rs). At
// startup a builder walks the catalogue, applies group gating, and produces
// opaque handles (handles.rs) that hot paths increment without any string
// lookup. The registry renders Prometheus text exposition on demand.
// =============================================================================

pub mod batcher;
pub mod catalogue;
pub mod guard;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};

pub use batcher::{BatcherHandle, CounterBatcher};
pub use catalogue::{MetricGroup, MetricKind, MetricSpec};
pub use guard::CardinalityGuard;
pub use registry::{Counter, Gauge, Histogram, MetricsHandles, MetricsRegistry};

/// f64 cell updated atomically via bit casts. Metric values are all f64 so
/// that counters of millisecond totals and gauges share one storage type.
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}
