use std::fmt::Write;

use hashbrown::HashSet;
use metrics::Unit;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, MetricSpec};
use crate::metric::{Instance, MetricKind, Row, Sample};
use crate::scale::{Scale, ScaleError, UnitSpec};
use crate::source::{InstanceDomain, ResolvedMetric, Source, SourceError};

/// Everything needed to turn a metric's rows into document values.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub name: String,
    pub label: String,
    pub domain: InstanceDomain,
    /// Unit values are reported in, after scaling.
    pub unit: UnitSpec,
    pub scale: Scale,
    pub kind: MetricKind,
    /// Whether counter values are converted to per-second rates.
    pub rate: bool,
    pub precision: u32,
    /// Display width in the check mode table.
    pub width: usize,
    pub value_source: ValueSource,
}

/// Selects the rows of one metric out of a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Single valued metric; only rows without an instance.
    Singular { metric: String },
    /// Multi-instance metric; an empty filter selects every instance.
    Instanced { metric: String, filter: Vec<String> },
}

impl ValueSource {
    /// Rows of this metric in `sample` that pass the instance filter.
    pub fn produce_rows<'a>(&'a self, sample: &'a Sample) -> impl Iterator<Item = &'a Row> + 'a {
        let metric = match self {
            ValueSource::Singular { metric } | ValueSource::Instanced { metric, .. } => metric,
        };

        sample
            .rows_for(metric)
            .filter(move |row| match (self, &row.instance) {
                (ValueSource::Singular { .. }, Instance::Null) => true,
                (ValueSource::Singular { .. }, Instance::Id { .. }) => false,
                (ValueSource::Instanced { filter, .. }, Instance::Null) => filter.is_empty(),
                (ValueSource::Instanced { filter, .. }, Instance::Id { name, .. }) => {
                    filter.is_empty() || filter.contains(name)
                }
            })
    }
}

/// Validated, ordered set of active metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricRegistry {
    metrics: Vec<MetricDescriptor>,
}

impl MetricRegistry {
    /// Resolves every configured metric against `source`.
    ///
    /// Duplicate names collapse to their first occurrence. Incompatible metrics
    /// are dropped with a warning when `config.ignore_incompat` is set.
    ///
    /// # Errors
    ///
    /// Errors on unknown metrics, incompatible metrics, or when no metric remains active.
    pub fn validate<S>(config: &Config, source: &S) -> Result<MetricRegistry, RegistryError>
    where
        S: Source + ?Sized,
    {
        let mut seen = HashSet::new();
        let mut metrics = Vec::with_capacity(config.metrics.len());

        for spec in &config.metrics {
            if !seen.insert(spec.name.as_str()) {
                debug!(metric = %spec.name, "Ignoring duplicate metric");
                continue;
            }

            let resolved = source.resolve(&spec.name).map_err(|err| match err {
                SourceError::UnknownMetric(name) => RegistryError::UnknownMetric(name),
                err => RegistryError::Source(err),
            })?;

            match Self::describe(config, spec, resolved) {
                Ok(Some(descriptor)) => metrics.push(descriptor),
                Ok(None) => debug!(metric = %spec.name, "Omitting single valued metric"),
                Err(Incompatible(reason)) if config.ignore_incompat => {
                    warn!(metric = %spec.name, %reason, "Ignoring incompatible metric");
                }
                Err(Incompatible(reason)) => {
                    return Err(RegistryError::IncompatibleMetric { name: spec.name.clone(), reason })
                }
            }
        }

        if metrics.is_empty() {
            return Err(RegistryError::Empty);
        }

        Ok(MetricRegistry { metrics })
    }

    /// Builds the descriptor of one metric, `None` when it is silently omitted.
    fn describe(
        config: &Config,
        spec: &MetricSpec,
        resolved: ResolvedMetric,
    ) -> Result<Option<MetricDescriptor>, Incompatible> {
        let explicit = !spec.instances.is_empty();
        let requested = match explicit {
            true => &spec.instances,
            false => &config.instances,
        };

        let value_source = match &resolved.domain {
            InstanceDomain::Singular if explicit => {
                return Err(Incompatible("metric has no instances".to_string()));
            }
            InstanceDomain::Singular if !requested.is_empty() && config.omit_flat => {
                return Ok(None);
            }
            InstanceDomain::Singular => ValueSource::Singular { metric: resolved.name.clone() },
            InstanceDomain::Fixed(instances) => {
                let exists =
                    |name: &String| instances.iter().any(|i| i.name() == Some(name.as_str()));
                if !requested.is_empty() && !requested.iter().any(exists) {
                    return Err(Incompatible(format!(
                        "none of the requested instances exist; requested={}",
                        requested.join("|")
                    )));
                }

                ValueSource::Instanced { metric: resolved.name.clone(), filter: requested.clone() }
            }
            InstanceDomain::Dynamic => {
                ValueSource::Instanced { metric: resolved.name.clone(), filter: requested.clone() }
            }
        };

        let source_unit = resolved.unit.unwrap_or(UnitSpec::new(Unit::Count));
        let unit = spec
            .unit
            .or_else(|| config.scales.for_dimension(source_unit.dimension()))
            .unwrap_or(source_unit);
        let scale = Scale::between(source_unit, unit)
            .map_err(|err: ScaleError| Incompatible(err.to_string()))?;

        let label = spec.label.clone().unwrap_or_else(|| resolved.name.clone());
        let width = spec.width.unwrap_or(0).max(label.chars().count());

        Ok(Some(MetricDescriptor {
            name: resolved.name,
            label,
            domain: resolved.domain,
            unit,
            scale,
            kind: resolved.kind,
            rate: resolved.kind == MetricKind::Counter && !spec.raw.unwrap_or(config.raw),
            precision: spec.precision.unwrap_or(config.precision),
            width,
            value_source,
        }))
    }

    /// Active metrics in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &MetricDescriptor> {
        self.metrics.iter()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetricDescriptor> {
        self.metrics.iter().find(|metric| metric.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Whether `name` is reported as a per-second rate.
    #[must_use]
    pub fn is_rate(&self, name: &str) -> bool {
        self.get(name).is_some_and(|metric| metric.rate)
    }

    /// One line per metric: label, name, unit and kind.
    #[must_use]
    pub fn table(&self) -> String {
        let mut table = String::new();
        for metric in &self.metrics {
            let kind = match (metric.kind, metric.rate) {
                (MetricKind::Counter, true) => "counter/s",
                (MetricKind::Counter, false) => "counter",
                (MetricKind::Instant, _) => "instant",
            };
            let _ = writeln!(
                table,
                "{:<width$}  {}  [{}]  {kind}",
                metric.label,
                metric.name,
                metric.unit,
                width = metric.width
            );
        }

        table
    }
}

impl FromIterator<MetricDescriptor> for MetricRegistry {
    fn from_iter<I: IntoIterator<Item = MetricDescriptor>>(iter: I) -> Self {
        MetricRegistry { metrics: iter.into_iter().collect() }
    }
}

/// Reason a metric cannot be sampled as requested.
struct Incompatible(String);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown metric; name={0}")]
    UnknownMetric(String),
    #[error("Incompatible metric; name={name}; reason={reason}")]
    IncompatibleMetric { name: String, reason: String },
    #[error("No metrics to sample")]
    Empty,
    #[error("Resolve metric; err={0}")]
    Source(#[from] SourceError),
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use expect_test::expect;

    use super::*;
    use crate::metric::RawValue;
    use crate::source::ArchiveSource;

    const HEADER: &str = r#"{"hostname":"h1","metrics":[{"name":"disk.read","kind":"counter","unit":"bytes"},{"name":"disk.dev.bytes","kind":"counter","unit":"bytes","instances":["sda","sdb"]},{"name":"kernel.load","kind":"instant"}]}
"#;

    fn source() -> ArchiveSource {
        ArchiveSource::from_reader(Cursor::new(HEADER), None).unwrap()
    }

    fn config(specs: &[&str]) -> Config {
        Config {
            metrics: specs.iter().map(|spec| spec.parse().unwrap()).collect(),
            ..Config::default()
        }
    }

    fn names(registry: &MetricRegistry) -> Vec<&str> {
        registry.iter().map(|metric| metric.name.as_str()).collect()
    }

    #[test]
    fn keeps_configuration_order_and_drops_duplicates() {
        let registry = MetricRegistry::validate(
            &config(&["kernel.load", "disk.read", "kernel.load,again"]),
            &source(),
        )
        .unwrap();

        assert_eq!(names(&registry), vec!["kernel.load", "disk.read"]);
        assert_eq!(registry.get("kernel.load").unwrap().label, "kernel.load");
    }

    #[test]
    fn descriptor_defaults() {
        let registry =
            MetricRegistry::validate(&config(&["disk.dev.bytes,io,,MiB,,2"]), &source()).unwrap();
        let metric = registry.get("disk.dev.bytes").unwrap();

        assert_eq!(metric.label, "io");
        assert_eq!(metric.width, 2);
        assert_eq!(metric.unit, UnitSpec::new(Unit::Mebibytes));
        assert!(metric.rate);
        assert_eq!(metric.precision, 3);
        assert_eq!(
            metric.value_source,
            ValueSource::Instanced { metric: "disk.dev.bytes".to_string(), filter: vec![] }
        );
        assert_eq!(metric.scale.apply(RawValue::Unsigned(1_048_576)), RawValue::Float(1.0));
    }

    #[test]
    fn raw_type_disables_rates() {
        let registry = MetricRegistry::validate(&config(&["disk.read,,,,raw"]), &source()).unwrap();

        assert!(!registry.is_rate("disk.read"));
    }

    #[test]
    fn unknown_metric_is_fatal_even_when_ignoring() {
        let mut config = config(&["disk.read", "net.in"]);
        config.ignore_incompat = true;

        let err = MetricRegistry::validate(&config, &source()).unwrap_err();
        expect!["Unknown metric; name=net.in"].assert_eq(&err.to_string());
    }

    #[test]
    fn instances_on_singular_metric() {
        let err =
            MetricRegistry::validate(&config(&["kernel.load,,cpu0"]), &source()).unwrap_err();
        expect!["Incompatible metric; name=kernel.load; reason=metric has no instances"]
            .assert_eq(&err.to_string());

        let mut ignoring = config(&["kernel.load,,cpu0", "disk.read"]);
        ignoring.ignore_incompat = true;
        let registry = MetricRegistry::validate(&ignoring, &source()).unwrap();
        assert_eq!(names(&registry), vec!["disk.read"]);
    }

    #[test]
    fn missing_fixed_instances() {
        let err = MetricRegistry::validate(&config(&["disk.dev.bytes,,sdc|sdd"]), &source())
            .unwrap_err();
        expect!["Incompatible metric; name=disk.dev.bytes; reason=none of the requested instances exist; requested=sdc|sdd"]
            .assert_eq(&err.to_string());

        let registry =
            MetricRegistry::validate(&config(&["disk.dev.bytes,,sdc|sdb"]), &source()).unwrap();
        assert_eq!(
            registry.get("disk.dev.bytes").unwrap().value_source,
            ValueSource::Instanced {
                metric: "disk.dev.bytes".to_string(),
                filter: vec!["sdc".to_string(), "sdb".to_string()],
            }
        );
    }

    #[test]
    fn global_filter_and_flat_metrics() {
        let mut config = config(&["kernel.load", "disk.dev.bytes"]);
        config.instances = vec!["sda".to_string()];

        let registry = MetricRegistry::validate(&config, &source()).unwrap();
        assert_eq!(names(&registry), vec!["kernel.load", "disk.dev.bytes"]);

        config.omit_flat = true;
        let registry = MetricRegistry::validate(&config, &source()).unwrap();
        assert_eq!(names(&registry), vec!["disk.dev.bytes"]);
    }

    #[test]
    fn incompatible_scale() {
        let err = MetricRegistry::validate(&config(&["disk.read,,,ms"]), &source()).unwrap_err();

        assert!(matches!(err, RegistryError::IncompatibleMetric { .. }));
    }

    #[test]
    fn nothing_left_is_an_error() {
        let mut config = config(&["kernel.load"]);
        config.instances = vec!["sda".to_string()];
        config.omit_flat = true;

        assert!(matches!(MetricRegistry::validate(&config, &source()), Err(RegistryError::Empty)));
    }

    #[test]
    fn produce_rows_filters_instances() {
        let sample = Sample {
            timestamp: std::time::UNIX_EPOCH,
            rows: vec![
                Row::new("disk.dev.bytes", Instance::id(0, "sda"), RawValue::Unsigned(1)),
                Row::new("disk.dev.bytes", Instance::id(1, "sdb"), RawValue::Unsigned(2)),
                Row::new("kernel.load", Instance::Null, RawValue::Float(0.5)),
            ],
        };

        let filtered = ValueSource::Instanced {
            metric: "disk.dev.bytes".to_string(),
            filter: vec!["sdb".to_string()],
        };
        let rows: Vec<_> = filtered.produce_rows(&sample).collect();
        assert_eq!(rows, vec![&sample.rows[1]]);

        let singular = ValueSource::Singular { metric: "kernel.load".to_string() };
        assert_eq!(singular.produce_rows(&sample).count(), 1);
    }

    #[test]
    fn check_table() {
        let registry = MetricRegistry::validate(
            &config(&["disk.read,reads,,,,8", "kernel.load,load"]),
            &source(),
        )
        .unwrap();

        expect![[r#"
            reads     disk.read  [B]  counter/s
            load  kernel.load  [count]  instant
        "#]]
        .assert_eq(&registry.table());
    }
}
