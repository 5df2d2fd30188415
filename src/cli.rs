use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use clap::Parser;
use metrics_index_exporter::config::{
    parse_duration, parse_instances, parse_time, Config, ConfigError, ConfigFile, MetricSpec,
    SourceConfig,
};
use metrics_index_exporter::scale::UnitSpec;

/// Sample metrics and store them as JSON documents in an Elasticsearch index.
#[derive(Debug, Parser)]
#[command(version)]
pub(crate) struct Args {
    /// Replay this archive instead of sampling live.
    #[arg(short = 'a', long)]
    pub(crate) archive: Option<PathBuf>,

    /// Config file; defaults to the first `metrics-index-exporter.toml` found.
    #[arg(short = 'c', long)]
    pub(crate) config: Option<PathBuf>,

    /// Check config and metrics, then exit.
    #[arg(short = 'C', long)]
    pub(crate) check: bool,

    /// Omit the startup banner.
    #[arg(short = 'H', long)]
    pub(crate) no_header: bool,

    /// Align the first live sample to a multiple of this period.
    #[arg(short = 'A', long, value_parser = parse_duration)]
    pub(crate) align: Option<Duration>,

    /// Skip archive records before this time (RFC 3339 or `+duration`).
    #[arg(short = 'S', long, value_parser = parse_time)]
    pub(crate) start: Option<SystemTime>,

    /// Stop at this time (RFC 3339 or `+duration`).
    #[arg(short = 'T', long, value_parser = parse_time)]
    pub(crate) finish: Option<SystemTime>,

    /// Number of samples to send.
    #[arg(short = 's', long)]
    pub(crate) samples: Option<u64>,

    /// Sampling interval.
    #[arg(short = 't', long, value_parser = parse_duration)]
    pub(crate) interval: Option<Duration>,

    /// Report raw counter values instead of rates.
    #[arg(short = 'r', long)]
    pub(crate) raw: bool,

    /// Drop incompatible metrics instead of failing.
    #[arg(short = 'I', long)]
    pub(crate) ignore_incompat: bool,

    /// Instances to report, separated by `,` or `|`; may be repeated.
    #[arg(short = 'i', long)]
    pub(crate) instances: Vec<String>,

    /// Omit single valued metrics when instances are filtered.
    #[arg(short = 'v', long)]
    pub(crate) omit_flat: bool,

    /// Digits after the decimal separator.
    #[arg(short = 'P', long)]
    pub(crate) precision: Option<u32>,

    /// Default unit for counts, e.g. `count x 10^3`.
    #[arg(short = 'q', long)]
    pub(crate) count_scale: Option<UnitSpec>,

    /// Default unit for sizes, e.g. `MiB`.
    #[arg(short = 'b', long)]
    pub(crate) space_scale: Option<UnitSpec>,

    /// Default unit for durations, e.g. `ms`.
    #[arg(short = 'y', long)]
    pub(crate) time_scale: Option<UnitSpec>,

    /// Elasticsearch server URL.
    #[arg(short = 'g', long)]
    pub(crate) es_server: Option<String>,

    /// Elasticsearch index.
    #[arg(short = 'x', long)]
    pub(crate) es_index: Option<String>,

    /// Host id stored with every document; defaults to the source's host name.
    #[arg(short = 'X', long)]
    pub(crate) es_hostid: Option<String>,

    #[arg(long, value_parser = parse_duration)]
    pub(crate) connect_timeout: Option<Duration>,

    #[arg(long, value_parser = parse_duration)]
    pub(crate) request_timeout: Option<Duration>,

    /// Log filter, overridden by `RUST_LOG`.
    #[arg(long, default_value = "info")]
    pub(crate) log_level: String,

    /// Metrics as `name[,label[,instances[,unit[,type[,width]]]]]`.
    pub(crate) metrics: Vec<MetricSpec>,
}

impl Args {
    /// Builds the configuration: defaults, then the config file, then the command line.
    pub(crate) fn into_config(self) -> Result<Config, ConfigError> {
        let file = match self.config.clone().or_else(ConfigFile::discover) {
            Some(path) => Some(ConfigFile::load(&path)?),
            None => None,
        };

        self.merge(file)
    }

    fn merge(self, file: Option<ConfigFile>) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        if let Some(file) = file {
            file.apply(&mut config)?;
        }

        if let Some(archive) = self.archive {
            config.source = SourceConfig::Archive(archive);
        }
        config.check |= self.check;
        config.header &= !self.no_header;
        config.align = self.align.or(config.align);
        config.start = self.start.or(config.start);
        config.finish = self.finish.or(config.finish);
        config.samples = self.samples.or(config.samples);
        config.interval = self.interval.unwrap_or(config.interval);
        config.raw |= self.raw;
        config.ignore_incompat |= self.ignore_incompat;
        if !self.instances.is_empty() {
            config.instances = self.instances.iter().flat_map(|arg| parse_instances(arg)).collect();
        }
        config.omit_flat |= self.omit_flat;
        config.precision = self.precision.unwrap_or(config.precision);
        config.scales.count = self.count_scale.or(config.scales.count);
        config.scales.space = self.space_scale.or(config.scales.space);
        config.scales.time = self.time_scale.or(config.scales.time);
        if let Some(server) = self.es_server {
            config.sink.server = server;
        }
        if let Some(index) = self.es_index {
            config.sink.index = index;
        }
        config.sink.host_id = self.es_hostid.or(config.sink.host_id);
        config.sink.connect_timeout = self.connect_timeout.unwrap_or(config.sink.connect_timeout);
        config.sink.request_timeout = self.request_timeout.unwrap_or(config.sink.request_timeout);
        config.metrics.extend(self.metrics);

        config.validate()?;

        Ok(config)
    }
}
