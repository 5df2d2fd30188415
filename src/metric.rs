use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Semantics of a metric's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic count, reported as a per-second rate unless raw output is requested.
    Counter,
    /// Point-in-time value, reported as is.
    Instant,
}

/// Instance a row's value belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instance {
    /// The metric has no instance domain.
    Null,
    Id { id: u32, name: String },
}

impl Instance {
    pub fn id(id: u32, name: impl Into<String>) -> Self {
        Instance::Id { id, name: name.into() }
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Instance::Null => None,
            Instance::Id { name, .. } => Some(name),
        }
    }
}

/// Raw value as reported by a source.
///
/// Serialized untagged so archives and documents carry plain JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
    Summary(Summary),
}

impl RawValue {
    /// Numeric view of the value, `None` for text and summaries.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Unsigned(v) => Some(*v as f64),
            RawValue::Signed(v) => Some(*v as f64),
            RawValue::Float(v) => Some(*v),
            RawValue::Text(_) | RawValue::Summary(_) => None,
        }
    }
}

/// Histogram summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub p999: f64,
    pub max: f64,
}

impl Summary {
    /// Applies `f` to every floating point field.
    #[must_use]
    pub fn map_floats<F>(self, f: F) -> Self
    where
        F: Fn(f64) -> f64,
    {
        let Summary { count, sum, min, p50, p90, p99, p999, max } = self;

        Summary {
            count,
            sum: f(sum),
            min: f(min),
            p50: f(p50),
            p90: f(p90),
            p99: f(p99),
            p999: f(p999),
            max: f(max),
        }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        [self.sum, self.min, self.p50, self.p90, self.p99, self.p999, self.max]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Reason a row's value could not be resolved this tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("No value available")]
    Missing,
    #[error("Counter has no prior sample to compute a rate from")]
    NoPriorSample,
    #[error("Counter went backwards")]
    CounterReset,
    #[error("Value is not finite")]
    NonFinite,
    #[error("Value is not numeric")]
    NotNumeric,
}

/// One (metric, instance, value) triple of a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub metric: String,
    pub instance: Instance,
    pub value: Result<RawValue, ValueError>,
}

impl Row {
    pub fn new(metric: impl Into<String>, instance: Instance, value: RawValue) -> Self {
        Row { metric: metric.into(), instance, value: Ok(value) }
    }
}

/// Point-in-time snapshot produced by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: SystemTime,
    pub rows: Vec<Row>,
}

impl Sample {
    /// Rows belonging to `metric`, in source order.
    pub fn rows_for<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = &'a Row> + 'a {
        self.rows.iter().filter(move |row| row.metric == metric)
    }

    /// Milliseconds since the unix epoch, zero for timestamps before it.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use expect_test::expect;
    use proptest::proptest;

    use super::*;

    #[test]
    fn kind_json_matches_archive_header() {
        proptest!(|(kind: MetricKind)| {
            let json = serde_json::to_string(&kind).unwrap();
            let expected = format!("\"{}\"", format!("{kind:?}").to_lowercase());

            assert_eq!(json, expected);
            assert_eq!(serde_json::from_str::<MetricKind>(&json).unwrap(), kind);
        });
    }

    #[test]
    fn raw_value_untagged_json() {
        let values = vec![
            RawValue::Unsigned(100),
            RawValue::Signed(-3),
            RawValue::Float(1.5),
            RawValue::Text("up".to_string()),
        ];

        expect![[r#"[100,-3,1.5,"up"]"#]].assert_eq(&serde_json::to_string(&values).unwrap());
    }

    #[test]
    fn raw_value_deserialize_picks_narrowest() {
        let values: Vec<RawValue> = serde_json::from_str(r#"[7, -7, 7.5, "x"]"#).unwrap();

        assert_eq!(
            values,
            vec![
                RawValue::Unsigned(7),
                RawValue::Signed(-7),
                RawValue::Float(7.5),
                RawValue::Text("x".to_string()),
            ]
        );
    }

    #[test]
    fn raw_value_deserialize_summary() {
        let value: RawValue = serde_json::from_str(
            r#"{"count":2,"sum":3.0,"min":1.0,"p50":1.0,"p90":2.0,"p99":2.0,"p999":2.0,"max":2.0}"#,
        )
        .unwrap();

        assert!(matches!(value, RawValue::Summary(Summary { count: 2, .. })));
    }

    #[test]
    fn summary_finite() {
        let summary = Summary {
            count: 1,
            sum: 1.0,
            min: 1.0,
            p50: 1.0,
            p90: 1.0,
            p99: 1.0,
            p999: 1.0,
            max: 1.0,
        };

        assert!(summary.is_finite());
        assert!(!Summary { p90: f64::NAN, ..summary }.is_finite());
    }

    #[test]
    fn sample_rows_for_metric() {
        let sample = Sample {
            timestamp: UNIX_EPOCH + Duration::from_millis(1_700_000_000_000),
            rows: vec![
                Row::new("a", Instance::Null, RawValue::Unsigned(1)),
                Row::new("b", Instance::id(0, "x"), RawValue::Unsigned(2)),
                Row::new("b", Instance::id(1, "y"), RawValue::Unsigned(3)),
            ],
        };

        assert_eq!(sample.rows_for("b").count(), 2);
        assert_eq!(sample.rows_for("c").count(), 0);
        assert_eq!(sample.timestamp_ms(), 1_700_000_000_000);
    }
}
