use std::num::NonZeroU32;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use itertools::Itertools;
use metrics::{
    Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SetRecorderError, SharedString,
    Unit,
};
use metrics_exporter_prometheus::Distribution;
use metrics_util::registry::Registry;
use metrics_util::Quantile;

use super::live_storage::{counter_value, gauge_value, LiveStorage};
use super::{Fetch, InstanceDomain, ResolvedMetric, Source, SourceError, SourceKind};
use crate::metric::{Instance, MetricKind, RawValue, Row, Sample, Summary};
use crate::scale::UnitSpec;

const BUCKET_COUNT: NonZeroU32 = NonZeroU32::new(3).unwrap();
const BUCKET_DURATION: Duration = Duration::from_secs(20);

/// In-process `metrics` recorder sampled by [`RecorderSource`].
///
/// Labels turn a metric into a multi-instance metric; the instance name is the
/// label values joined with `,`.
#[derive(Debug, Clone)]
pub struct IndexRecorder {
    pub(crate) registry: Arc<Registry<Key, LiveStorage>>,
    descriptions: Arc<RwLock<HashMap<String, Description>>>,
}

#[derive(Debug, Clone, Copy)]
struct Description {
    kind: MetricKind,
    unit: Option<Unit>,
}

impl IndexRecorder {
    #[must_use]
    pub fn new() -> Self {
        IndexRecorder {
            registry: Arc::new(Registry::new(LiveStorage)),
            descriptions: Arc::default(),
        }
    }

    /// Installs a new recorder as the global `metrics` recorder and returns a handle to it.
    ///
    /// # Errors
    ///
    /// Errors if a global recorder is already installed.
    pub fn install() -> Result<Self, SetRecorderError<Self>> {
        let recorder = IndexRecorder::new();
        metrics::set_global_recorder(recorder.clone())?;

        Ok(recorder)
    }

    fn describe(&self, key: &KeyName, kind: MetricKind, unit: Option<Unit>) {
        self.descriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.as_str().to_string(), Description { kind, unit });
    }

    fn description(&self, name: &str) -> Option<Description> {
        self.descriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }
}

impl Default for IndexRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder for IndexRecorder {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, _: SharedString) {
        self.describe(&key, MetricKind::Counter, unit);
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, _: SharedString) {
        self.describe(&key, MetricKind::Instant, unit);
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, _: SharedString) {
        self.describe(&key, MetricKind::Instant, unit);
    }

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |counter| counter.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry
            .get_or_create_gauge(key, |gauge| gauge.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |histogram| histogram.clone().into())
    }
}

/// Live source reading the current values held by an [`IndexRecorder`].
pub struct RecorderSource {
    recorder: IndexRecorder,
    hostname: String,
    instance_ids: HashMap<String, HashMap<String, u32>>,
    histograms: HashMap<u64, Distribution>,
    last_timestamp: Option<SystemTime>,
}

impl RecorderSource {
    #[must_use]
    pub fn new(recorder: IndexRecorder) -> Self {
        RecorderSource {
            recorder,
            hostname: local_hostname(),
            instance_ids: HashMap::default(),
            histograms: HashMap::default(),
            last_timestamp: None,
        }
    }

    /// Instance of `key`, numbering new label sets per metric in order of appearance.
    fn instance(
        instance_ids: &mut HashMap<String, HashMap<String, u32>>,
        key: &Key,
    ) -> Instance {
        if key.labels().len() == 0 {
            return Instance::Null;
        }

        let name = key.labels().map(metrics::Label::value).join(",");
        let ids = instance_ids.entry(key.name().to_string()).or_default();
        let next = u32::try_from(ids.len()).unwrap_or(u32::MAX);
        let id = *ids.entry(name.clone()).or_insert(next);

        Instance::Id { id, name }
    }

    fn summarize(&mut self, key: &Key, samples: &[(f64, quanta::Instant)]) -> Summary {
        let distribution = match self.histograms.entry(key.get_hash()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let quantiles = Arc::new(vec![
                    Quantile::new(0.0),
                    Quantile::new(0.50),
                    Quantile::new(0.90),
                    Quantile::new(0.99),
                    Quantile::new(0.999),
                    Quantile::new(1.0),
                ]);

                entry.insert(Distribution::new_summary(quantiles, BUCKET_DURATION, BUCKET_COUNT))
            }
        };
        distribution.record_samples(samples);

        let Distribution::Summary(summary, _, sum) = &*distribution else {
            unreachable!();
        };
        let snapshot = summary.snapshot(quanta::Instant::now());

        Summary {
            count: u64::try_from(summary.count()).unwrap_or(u64::MAX),
            sum: *sum,
            min: snapshot.quantile(0.0).unwrap_or(0.0),
            p50: snapshot.quantile(0.50).unwrap_or(0.0),
            p90: snapshot.quantile(0.90).unwrap_or(0.0),
            p99: snapshot.quantile(0.99).unwrap_or(0.0),
            p999: snapshot.quantile(0.999).unwrap_or(0.0),
            max: snapshot.quantile(1.0).unwrap_or(0.0),
        }
    }
}

impl Source for RecorderSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn resolve(&self, name: &str) -> Result<ResolvedMetric, SourceError> {
        let mut kind = None;
        let mut labelled = None;
        let mut observe = |key: &Key, key_kind: MetricKind| {
            if key.name() == name {
                kind.get_or_insert(key_kind);
                let has_labels = key.labels().len() > 0;
                labelled = Some(labelled.unwrap_or(false) || has_labels);
            }
        };

        let registry = &self.recorder.registry;
        registry.visit_counters(|key, _| observe(key, MetricKind::Counter));
        registry.visit_gauges(|key, _| observe(key, MetricKind::Instant));
        registry.visit_histograms(|key, _| observe(key, MetricKind::Instant));

        let description = self.recorder.description(name);
        let kind = kind
            .or(description.map(|description| description.kind))
            .ok_or_else(|| SourceError::UnknownMetric(name.to_string()))?;
        let domain = match labelled {
            Some(false) => InstanceDomain::Singular,
            Some(true) | None => InstanceDomain::Dynamic,
        };

        Ok(ResolvedMetric {
            name: name.to_string(),
            kind,
            unit: description
                .and_then(|description| description.unit)
                .map(UnitSpec::new),
            domain,
        })
    }

    fn fetch(&mut self) -> Result<Fetch, SourceError> {
        let timestamp = SystemTime::now();
        let mut rows = Vec::new();
        let registry = Arc::clone(&self.recorder.registry);

        registry.visit_counters(|key, counter| {
            let instance = Self::instance(&mut self.instance_ids, key);
            rows.push(Row::new(key.name(), instance, counter_value(counter)));
        });

        registry.visit_gauges(|key, gauge| {
            let instance = Self::instance(&mut self.instance_ids, key);
            rows.push(Row::new(key.name(), instance, gauge_value(gauge)));
        });

        registry.visit_histograms(|key, histogram| {
            let instance = Self::instance(&mut self.instance_ids, key);
            let summary = self.summarize(key, &histogram.take());
            rows.push(Row::new(key.name(), instance, RawValue::Summary(summary)));
        });

        self.last_timestamp = Some(timestamp);

        Ok(Fetch::Sample(Sample { timestamp, rows }))
    }

    fn last_timestamp(&self) -> Option<SystemTime> {
        self.last_timestamp
    }
}

/// Best effort name of the local host.
fn local_hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .into_iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}
