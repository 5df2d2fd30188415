//! Storage behind the live recorder's registry.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use metrics::atomics::AtomicU64;
use metrics::HistogramFn;
use metrics_util::registry::Storage;
use metrics_util::storage::AtomicBucket;
use quanta::Instant;

use crate::metric::RawValue;

#[derive(Debug)]
pub(crate) struct LiveStorage;

impl<K> Storage<K> for LiveStorage {
    type Counter = Arc<AtomicU64>;
    /// Holds the bit pattern of an `f64`.
    type Gauge = Arc<AtomicU64>;
    type Histogram = Arc<PendingSamples>;

    fn counter(&self, _: &K) -> Self::Counter {
        Arc::default()
    }

    fn gauge(&self, _: &K) -> Self::Gauge {
        Arc::default()
    }

    fn histogram(&self, _: &K) -> Self::Histogram {
        Arc::new(PendingSamples::new())
    }
}

pub(crate) fn counter_value(counter: &AtomicU64) -> RawValue {
    RawValue::Unsigned(counter.load(Ordering::Relaxed))
}

pub(crate) fn gauge_value(gauge: &AtomicU64) -> RawValue {
    RawValue::Float(f64::from_bits(gauge.load(Ordering::Relaxed)))
}

/// Histogram observations recorded since the last fetch.
#[derive(Debug)]
pub(crate) struct PendingSamples {
    bucket: AtomicBucket<(f64, Instant)>,
}

impl PendingSamples {
    fn new() -> Self {
        PendingSamples { bucket: AtomicBucket::new() }
    }

    /// Removes and returns every pending observation.
    pub(crate) fn take(&self) -> Vec<(f64, Instant)> {
        let mut taken = Vec::new();
        self.bucket.clear_with(|block| taken.extend_from_slice(block));

        taken
    }
}

impl HistogramFn for PendingSamples {
    fn record(&self, value: f64) {
        self.bucket.push((value, Instant::now()));
    }
}
