use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::metric::{Instance, RawValue, Row, Sample, ValueError};
use crate::registry::{MetricDescriptor, MetricRegistry};

pub const HOST_ID: &str = "@host-id";
pub const TIMESTAMP: &str = "@timestamp";
pub const INSTANCES: &str = "@instances";
pub const INSTANCE_ID: &str = "@id";

/// One outgoing record: metadata plus the sample's values nested by dotted name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Rows and metrics left out of a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Rows whose value failed to resolve.
    pub skipped_rows: u64,
    /// Metrics whose path conflicted with an earlier metric.
    pub failed_metrics: u64,
}

/// A metric path runs through a scalar, or a scalar lands on an internal node.
#[derive(Debug)]
struct PathConflict;

/// Shapes one sample into a document.
///
/// Single valued metrics are placed as scalars at their full dotted path.
/// Instances of a metric `a.b.c` are merged into the `@instances` array of
/// `a.b`, one entry per instance name holding the `c` field.
#[must_use]
pub fn build(sample: &Sample, registry: &MetricRegistry, host_id: &str) -> (Document, BuildStats) {
    let mut builder = Builder::default();
    builder.root.insert(HOST_ID.to_string(), Value::from(host_id));
    builder.root.insert(TIMESTAMP.to_string(), Value::from(sample.timestamp_ms()));

    for metric in registry.iter() {
        builder.metric(metric, sample);
    }

    (Document(builder.root), builder.stats)
}

#[derive(Default)]
struct Builder {
    root: Map<String, Value>,
    /// (parent path, instance name) -> position in the parent's `@instances`.
    positions: HashMap<(String, String), usize>,
    stats: BuildStats,
}

impl Builder {
    #[allow(clippy::arithmetic_side_effects)]
    fn metric(&mut self, metric: &MetricDescriptor, sample: &Sample) {
        let (parent, leaf) = match metric.name.rsplit_once('.') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, metric.name.as_str()),
        };

        for row in metric.value_source.produce_rows(sample) {
            let Ok(value) = resolve(metric, row) else {
                self.stats.skipped_rows += 1;
                continue;
            };

            if self.insert(parent, leaf, &row.instance, value).is_err() {
                self.stats.failed_metrics += 1;
                break;
            }
        }
    }

    fn insert(
        &mut self,
        parent: Option<&str>,
        leaf: &str,
        instance: &Instance,
        value: Value,
    ) -> Result<(), PathConflict> {
        let mut node = &mut self.root;
        for segment in parent.into_iter().flat_map(|parent| parent.split('.')) {
            node = node
                .entry(segment)
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .ok_or(PathConflict)?;
        }

        let name = match instance {
            Instance::Null => {
                if node.get(leaf).is_some_and(Value::is_object) {
                    return Err(PathConflict);
                }
                node.insert(leaf.to_string(), value);

                return Ok(());
            }
            Instance::Id { name, .. } => name,
        };

        let entries = node
            .entry(INSTANCES)
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or(PathConflict)?;
        let key = (parent.unwrap_or_default().to_string(), name.clone());
        let position = *self.positions.entry(key).or_insert_with(|| {
            let mut entry = Map::new();
            entry.insert(INSTANCE_ID.to_string(), Value::from(name.as_str()));
            entries.push(Value::Object(entry));

            entries.len().saturating_sub(1)
        });

        entries
            .get_mut(position)
            .and_then(Value::as_object_mut)
            .ok_or(PathConflict)?
            .insert(leaf.to_string(), value);

        Ok(())
    }
}

/// Scales and rounds a row's value into JSON.
fn resolve(metric: &MetricDescriptor, row: &Row) -> Result<Value, ValueError> {
    let value = metric.scale.apply(row.value.clone()?);

    match value {
        RawValue::Unsigned(value) => Ok(Value::from(value)),
        RawValue::Signed(value) => Ok(Value::from(value)),
        RawValue::Float(value) => Number::from_f64(round(value, metric.precision))
            .map(Value::Number)
            .ok_or(ValueError::NonFinite),
        RawValue::Text(value) => Ok(Value::String(value)),
        RawValue::Summary(summary) => {
            let summary = summary.map_floats(|value| round(value, metric.precision));
            if !summary.is_finite() {
                return Err(ValueError::NonFinite);
            }

            serde_json::to_value(summary).map_err(|_| ValueError::NonFinite)
        }
    }
}

/// Rounds half away from zero to `precision` decimal digits.
fn round(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(i32::try_from(precision).unwrap_or(i32::MAX));
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }

    scaled.round() / factor
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use expect_test::expect;
    use metrics::Unit;
    use proptest::prelude::*;

    use super::*;
    use crate::metric::{MetricKind, Summary};
    use crate::registry::ValueSource;
    use crate::scale::{Scale, UnitSpec};
    use crate::source::InstanceDomain;

    fn descriptor(name: &str, instanced: bool) -> MetricDescriptor {
        let metric = name.to_string();

        MetricDescriptor {
            name: metric.clone(),
            label: metric.clone(),
            domain: match instanced {
                true => InstanceDomain::Dynamic,
                false => InstanceDomain::Singular,
            },
            unit: UnitSpec::new(Unit::Count),
            scale: Scale::IDENTITY,
            kind: MetricKind::Instant,
            rate: false,
            precision: 3,
            width: name.len(),
            value_source: match instanced {
                true => ValueSource::Instanced { metric, filter: Vec::new() },
                false => ValueSource::Singular { metric },
            },
        }
    }

    fn sample(rows: Vec<Row>) -> Sample {
        Sample { timestamp: UNIX_EPOCH + Duration::from_millis(1_700_000_000_000), rows }
    }

    fn json(document: &Document) -> String {
        serde_json::to_string(document).unwrap()
    }

    #[test]
    fn scalar_and_instanced_metrics() {
        let registry: MetricRegistry =
            [descriptor("disk.read", false), descriptor("disk.dev.bytes", true)]
                .into_iter()
                .collect();
        let sample = sample(vec![
            Row::new("disk.read", Instance::Null, RawValue::Unsigned(100)),
            Row::new("disk.dev.bytes", Instance::id(0, "sda"), RawValue::Unsigned(10)),
            Row::new("disk.dev.bytes", Instance::id(1, "sdb"), RawValue::Unsigned(20)),
        ]);

        let (document, stats) = build(&sample, &registry, "h1");

        expect![[r#"{"@host-id":"h1","@timestamp":1700000000000,"disk":{"read":100,"dev":{"@instances":[{"@id":"sda","bytes":10},{"@id":"sdb","bytes":20}]}}}"#]]
            .assert_eq(&json(&document));
        assert_eq!(stats, BuildStats::default());
    }

    #[test]
    fn sibling_metrics_share_instance_entries() {
        let registry: MetricRegistry =
            [descriptor("disk.dev.read", true), descriptor("disk.dev.write", true)]
                .into_iter()
                .collect();
        let sample = sample(vec![
            Row::new("disk.dev.read", Instance::id(0, "sda"), RawValue::Unsigned(1)),
            Row::new("disk.dev.write", Instance::id(1, "sdb"), RawValue::Unsigned(4)),
            Row::new("disk.dev.write", Instance::id(0, "sda"), RawValue::Unsigned(2)),
        ]);

        let (document, _) = build(&sample, &registry, "h1");

        expect![[r#"{"@host-id":"h1","@timestamp":1700000000000,"disk":{"dev":{"@instances":[{"@id":"sda","read":1,"write":2},{"@id":"sdb","write":4}]}}}"#]]
            .assert_eq(&json(&document));
    }

    #[test]
    fn unresolved_values_are_skipped() {
        let registry: MetricRegistry =
            [descriptor("kernel.load", false), descriptor("disk.dev.bytes", true)]
                .into_iter()
                .collect();
        let sample = sample(vec![
            Row {
                metric: "kernel.load".to_string(),
                instance: Instance::Null,
                value: Err(ValueError::Missing),
            },
            Row::new("disk.dev.bytes", Instance::id(0, "sda"), RawValue::Float(f64::NAN)),
            Row::new("disk.dev.bytes", Instance::id(1, "sdb"), RawValue::Float(2.0)),
        ]);

        let (document, stats) = build(&sample, &registry, "h1");

        expect![[r#"{"@host-id":"h1","@timestamp":1700000000000,"disk":{"dev":{"@instances":[{"@id":"sdb","bytes":2.0}]}}}"#]]
            .assert_eq(&json(&document));
        assert_eq!(stats, BuildStats { skipped_rows: 2, failed_metrics: 0 });
    }

    #[test]
    fn path_conflict_stops_only_that_metric() {
        let registry: MetricRegistry = [
            descriptor("disk.dev", false),
            descriptor("disk.dev.bytes", false),
            descriptor("kernel.load", false),
        ]
        .into_iter()
        .collect();
        let sample = sample(vec![
            Row::new("disk.dev", Instance::Null, RawValue::Unsigned(1)),
            Row::new("disk.dev.bytes", Instance::Null, RawValue::Unsigned(2)),
            Row::new("kernel.load", Instance::Null, RawValue::Float(0.25)),
        ]);

        let (document, stats) = build(&sample, &registry, "h1");

        expect![[r#"{"@host-id":"h1","@timestamp":1700000000000,"disk":{"dev":1},"kernel":{"load":0.25}}"#]]
            .assert_eq(&json(&document));
        assert_eq!(stats, BuildStats { skipped_rows: 0, failed_metrics: 1 });
    }

    #[test]
    fn floats_are_rounded_integers_are_not() {
        let registry: MetricRegistry =
            [descriptor("a.float", false), descriptor("a.int", false), descriptor("a.text", false)]
                .into_iter()
                .collect();
        let sample = sample(vec![
            Row::new("a.float", Instance::Null, RawValue::Float(1.234_56)),
            Row::new("a.int", Instance::Null, RawValue::Signed(-123_456)),
            Row::new("a.text", Instance::Null, RawValue::Text("1.23456".to_string())),
        ]);

        let (document, _) = build(&sample, &registry, "h1");

        expect![[r#"{"@host-id":"h1","@timestamp":1700000000000,"a":{"float":1.235,"int":-123456,"text":"1.23456"}}"#]]
            .assert_eq(&json(&document));
    }

    #[test]
    fn summaries_become_objects() {
        let registry: MetricRegistry = [descriptor("rpc.latency", false)].into_iter().collect();
        let summary = Summary {
            count: 3,
            sum: 6.0,
            min: 1.0,
            p50: 2.000_4,
            p90: 2.999_9,
            p99: 3.0,
            p999: 3.0,
            max: 3.0,
        };
        let sample =
            sample(vec![Row::new("rpc.latency", Instance::Null, RawValue::Summary(summary))]);

        let (document, _) = build(&sample, &registry, "h1");

        expect![[r#"{"@host-id":"h1","@timestamp":1700000000000,"rpc":{"latency":{"count":3,"sum":6.0,"min":1.0,"p50":2.0,"p90":3.0,"p99":3.0,"p999":3.0,"max":3.0}}}"#]]
            .assert_eq(&json(&document));
    }

    #[test]
    fn rounding() {
        assert!((round(1.234_56, 3) - 1.235).abs() < f64::EPSILON);
        assert!((round(-2.5, 0) + 3.0).abs() < f64::EPSILON);
        assert!((round(0.125, 2) - 0.13).abs() < f64::EPSILON);
    }

    fn metric_path() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-z]{1,6}", 1..5)
    }

    /// Follows `path` through nested objects.
    fn lookup<'a>(document: &'a Document, path: &[String]) -> Option<&'a Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(document.as_map().get(first)?, |node, segment| node.get(segment))
    }

    proptest! {
        #[test]
        fn single_valued_metric_is_scalar_at_full_path(path in metric_path(), value in any::<u64>()) {
            let name = path.join(".");
            let registry: MetricRegistry = [descriptor(&name, false)].into_iter().collect();
            let sample = sample(vec![Row::new(name, Instance::Null, RawValue::Unsigned(value))]);

            let (document, _) = build(&sample, &registry, "h1");

            prop_assert_eq!(lookup(&document, &path), Some(&Value::from(value)));
        }

        #[test]
        fn repeated_instance_collapses_to_one_entry(
            path in metric_path(),
            instance in "[a-z0-9]{1,4}",
            first in any::<u64>(),
            second in any::<u64>(),
        ) {
            let name = path.join(".");
            let registry: MetricRegistry = [descriptor(&name, true)].into_iter().collect();
            let sample = sample(vec![
                Row::new(name.clone(), Instance::id(0, instance.clone()), RawValue::Unsigned(first)),
                Row::new(name, Instance::id(0, instance.clone()), RawValue::Unsigned(second)),
            ]);

            let (document, _) = build(&sample, &registry, "h1");

            let (leaf, parent) = path.split_last().unwrap();
            let node = match parent.is_empty() {
                true => Some(document.as_map().get(INSTANCES).unwrap()),
                false => lookup(&document, parent).and_then(|node| node.get(INSTANCES)),
            };
            let mut entry = Map::new();
            entry.insert(INSTANCE_ID.to_string(), Value::from(instance));
            entry.insert(leaf.clone(), Value::from(second));
            prop_assert_eq!(node, Some(&Value::Array(vec![Value::Object(entry)])));
        }
    }
}
