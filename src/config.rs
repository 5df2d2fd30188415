use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::scale::{Dimension, ScaleError, UnitSpec};

/// Version of the config file format understood by this build.
pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_SERVER: &str = "http://localhost:9200/";
pub const DEFAULT_INDEX: &str = "metrics";
pub const DEFAULT_PRECISION: u32 = 3;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
/// Longest accepted sampling interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const CONFIG_FILE_NAME: &str = "metrics-index-exporter.toml";

/// Runtime configuration.
///
/// Built once during startup and passed by reference afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Where samples come from.
    pub source: SourceConfig,
    /// Metrics to report, in report order.
    pub metrics: Vec<MetricSpec>,
    /// Instances to report for metrics without their own instance list; empty means all.
    pub instances: Vec<String>,
    /// Drop single-valued metrics when a global instance filter is set.
    pub omit_flat: bool,
    /// Drop incompatible metrics with a warning instead of failing.
    pub ignore_incompat: bool,
    /// Report counters as raw values instead of per-second rates.
    pub raw: bool,
    /// Digits after the decimal separator for floating point values.
    pub precision: u32,
    /// Default target units per dimension.
    pub scales: Scales,
    /// Number of samples to send; `None` runs until the source ends or the run is cancelled.
    pub samples: Option<u64>,
    /// Sampling interval for live sources.
    pub interval: Duration,
    /// Align the first live sample to a multiple of this period on the wall clock.
    pub align: Option<Duration>,
    /// Archive records before this time are skipped.
    pub start: Option<SystemTime>,
    /// Samples after this time end the run.
    pub finish: Option<SystemTime>,
    /// Log a startup banner.
    pub header: bool,
    /// Validate the configuration and metrics, then exit without sampling.
    pub check: bool,
    pub sink: SinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            source: SourceConfig::Live,
            metrics: Vec::new(),
            instances: Vec::new(),
            omit_flat: false,
            ignore_incompat: false,
            raw: false,
            precision: DEFAULT_PRECISION,
            scales: Scales::default(),
            samples: None,
            interval: DEFAULT_INTERVAL,
            align: None,
            start: None,
            finish: None,
            header: true,
            check: false,
            sink: SinkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    /// The in-process `metrics` recorder.
    Live,
    /// A JSON-lines archive file.
    Archive(PathBuf),
}

/// Default target units, applied to metrics whose unit falls in the matching dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scales {
    pub count: Option<UnitSpec>,
    pub space: Option<UnitSpec>,
    pub time: Option<UnitSpec>,
}

impl Scales {
    #[must_use]
    pub const fn for_dimension(&self, dimension: Dimension) -> Option<UnitSpec> {
        match dimension {
            Dimension::Count => self.count,
            Dimension::Space => self.space,
            Dimension::Time => self.time,
            Dimension::BitRate | Dimension::Rate | Dimension::Percent => None,
        }
    }
}

/// Index store connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Base URL of the index server.
    pub server: String,
    /// Index documents are written to.
    pub index: String,
    /// Value of `@host-id`; defaults to the source's host name.
    pub host_id: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            server: DEFAULT_SERVER.to_string(),
            index: DEFAULT_INDEX.to_string(),
            host_id: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A requested metric with its per-metric overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricSpec {
    pub name: String,
    pub label: Option<String>,
    #[serde(default)]
    pub instances: Vec<String>,
    pub unit: Option<UnitSpec>,
    pub raw: Option<bool>,
    pub width: Option<usize>,
    pub precision: Option<u32>,
}

impl MetricSpec {
    pub fn new(name: impl Into<String>) -> Self {
        MetricSpec { name: name.into(), ..MetricSpec::default() }
    }
}

/// Parses `name[,label[,instances[,unit[,type[,width]]]]]`.
///
/// Instances are separated by `|`; the only recognised type is `raw`. Empty
/// fields keep their defaults.
impl FromStr for MetricSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::MetricSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let mut fields = s.split(',').map(str::trim);
        let name = match fields.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(invalid("missing metric name")),
        };
        let mut spec = MetricSpec::new(name);

        if let Some(label) = fields.next().filter(|f| !f.is_empty()) {
            spec.label = Some(label.to_string());
        }
        if let Some(instances) = fields.next().filter(|f| !f.is_empty()) {
            spec.instances = parse_instances(instances);
        }
        if let Some(unit) = fields.next().filter(|f| !f.is_empty()) {
            spec.unit = Some(unit.parse()?);
        }
        match fields.next().filter(|f| !f.is_empty()) {
            Some("raw") => spec.raw = Some(true),
            Some(_) => return Err(invalid("unknown type, expected `raw`")),
            None => {}
        }
        if let Some(width) = fields.next().filter(|f| !f.is_empty()) {
            spec.width = Some(width.parse().map_err(|_| invalid("width is not an integer"))?);
        }
        if fields.next().is_some() {
            return Err(invalid("too many fields"));
        }

        Ok(spec)
    }
}

/// Splits an instance list on `|` and `,`, dropping empty names.
#[must_use]
pub fn parse_instances(s: &str) -> Vec<String> {
    s.split(['|', ','])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parses a duration such as `10s`, `1m 30s` or `250ms`.
///
/// # Errors
///
/// Errors when the value is not a valid duration.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(s)
        .map_err(|source| ConfigError::Duration { value: s.to_string(), source })
}

/// Parses an RFC 3339 timestamp, or a `+duration` relative to now.
///
/// # Errors
///
/// Errors when the value is neither.
pub fn parse_time(s: &str) -> Result<SystemTime, ConfigError> {
    if let Some(relative) = s.strip_prefix('+') {
        return SystemTime::now()
            .checked_add(parse_duration(relative)?)
            .ok_or_else(|| ConfigError::TimeOutOfRange(s.to_string()));
    }

    humantime::parse_rfc3339_weak(s)
        .map_err(|source| ConfigError::Timestamp { value: s.to_string(), source })
}

/// On-disk configuration; every key is optional and overrides the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub version: Option<u32>,
    pub archive: Option<PathBuf>,
    pub samples: Option<u64>,
    pub interval: Option<String>,
    pub align: Option<String>,
    pub start: Option<String>,
    pub finish: Option<String>,
    pub precision: Option<u32>,
    pub raw: Option<bool>,
    pub header: Option<bool>,
    pub instances: Option<Vec<String>>,
    pub omit_flat: Option<bool>,
    pub ignore_incompat: Option<bool>,
    pub count_scale: Option<UnitSpec>,
    pub space_scale: Option<UnitSpec>,
    pub time_scale: Option<UnitSpec>,
    pub es_server: Option<String>,
    pub es_index: Option<String>,
    pub es_hostid: Option<String>,
    pub connect_timeout: Option<String>,
    pub request_timeout: Option<String>,
    #[serde(default, rename = "metric")]
    pub metrics: Vec<MetricSpec>,
}

impl ConfigFile {
    /// Reads and parses `path`.
    ///
    /// # Errors
    ///
    /// Errors when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<ConfigFile, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;

        Self::parse(&contents).map_err(|err| match err {
            ConfigError::Parse { source, .. } => {
                ConfigError::Parse { path: Some(path.to_path_buf()), source }
            }
            err => err,
        })
    }

    /// Parses TOML config contents.
    ///
    /// # Errors
    ///
    /// Errors on malformed TOML or unknown keys.
    pub fn parse(contents: &str) -> Result<ConfigFile, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse { path: None, source })
    }

    /// First existing file among the default locations.
    #[must_use]
    pub fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        let user = ProjectDirs::from("", "", "metrics-index-exporter")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME));

        std::iter::once(local).chain(user).find(|path| path.is_file())
    }

    /// Applies the file's settings on top of `config`.
    ///
    /// # Errors
    ///
    /// Errors on an unsupported version or malformed values.
    pub fn apply(self, config: &mut Config) -> Result<(), ConfigError> {
        let version = self.version.unwrap_or(CONFIG_VERSION);
        if version != CONFIG_VERSION {
            return Err(ConfigError::Version { found: version, expected: CONFIG_VERSION });
        }

        if let Some(archive) = self.archive {
            config.source = SourceConfig::Archive(archive);
        }
        if let Some(samples) = self.samples {
            config.samples = Some(samples);
        }
        if let Some(interval) = self.interval {
            config.interval = parse_duration(&interval)?;
        }
        if let Some(align) = self.align {
            config.align = Some(parse_duration(&align)?);
        }
        if let Some(start) = self.start {
            config.start = Some(parse_time(&start)?);
        }
        if let Some(finish) = self.finish {
            config.finish = Some(parse_time(&finish)?);
        }
        if let Some(precision) = self.precision {
            config.precision = precision;
        }
        if let Some(raw) = self.raw {
            config.raw = raw;
        }
        if let Some(header) = self.header {
            config.header = header;
        }
        if let Some(instances) = self.instances {
            config.instances = instances;
        }
        if let Some(omit_flat) = self.omit_flat {
            config.omit_flat = omit_flat;
        }
        if let Some(ignore_incompat) = self.ignore_incompat {
            config.ignore_incompat = ignore_incompat;
        }
        config.scales.count = self.count_scale.or(config.scales.count);
        config.scales.space = self.space_scale.or(config.scales.space);
        config.scales.time = self.time_scale.or(config.scales.time);
        if let Some(server) = self.es_server {
            config.sink.server = server;
        }
        if let Some(index) = self.es_index {
            config.sink.index = index;
        }
        if let Some(host_id) = self.es_hostid {
            config.sink.host_id = Some(host_id);
        }
        if let Some(timeout) = self.connect_timeout {
            config.sink.connect_timeout = parse_duration(&timeout)?;
        }
        if let Some(timeout) = self.request_timeout {
            config.sink.request_timeout = parse_duration(&timeout)?;
        }
        config.metrics.extend(self.metrics);

        Ok(())
    }
}

impl Config {
    /// Checks settings that no later stage can recover from.
    ///
    /// # Errors
    ///
    /// Errors when no metrics are requested, the interval is out of range, or the
    /// window is inverted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics.is_empty() {
            return Err(ConfigError::NoMetrics);
        }
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.interval > MAX_INTERVAL {
            return Err(ConfigError::IntervalTooLong(self.interval));
        }
        if let (Some(start), Some(finish)) = (self.start, self.finish) {
            if finish < start {
                return Err(ConfigError::EmptyWindow);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Read config file; path={path:?}; err={source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Parse config file; path={path:?}; err={source}")]
    Parse { path: Option<PathBuf>, source: toml::de::Error },
    #[error("Incompatible configuration file version; read=v{found}; need=v{expected}")]
    Version { found: u32, expected: u32 },
    #[error("Invalid duration; value={value}; err={source}")]
    Duration { value: String, source: humantime::DurationError },
    #[error("Invalid timestamp; value={value}; err={source}")]
    Timestamp { value: String, source: humantime::TimestampError },
    #[error("Timestamp out of range; value={0}")]
    TimeOutOfRange(String),
    #[error("Invalid metric spec; spec={spec}; reason={reason}")]
    MetricSpec { spec: String, reason: String },
    #[error(transparent)]
    Unit(#[from] ScaleError),
    #[error("No metrics requested")]
    NoMetrics,
    #[error("Interval must be greater than zero")]
    ZeroInterval,
    #[error("Interval too long; interval={0:?}")]
    IntervalTooLong(Duration),
    #[error("Finish time is before start time")]
    EmptyWindow,
}
