use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::Deserialize;
use tracing::debug;

use super::{Fetch, InstanceDomain, ResolvedMetric, Source, SourceError, SourceKind};
use crate::metric::{Instance, MetricKind, RawValue, Row, Sample, ValueError};
use crate::scale::UnitSpec;

/// Replays snapshots recorded in a JSON-lines archive.
///
/// The first line is a header describing the host and its metrics, every
/// following line one timestamped snapshot:
///
/// ```text
/// {"hostname":"h1","metrics":[{"name":"disk.dev.bytes","kind":"counter","unit":"bytes","instances":["sda","sdb"]}]}
/// {"timestamp_ms":1700000000000,"values":{"disk.dev.bytes":{"sda":10,"sdb":20}}}
/// ```
pub struct ArchiveSource {
    reader: Box<dyn BufRead + Send>,
    line: u64,
    hostname: String,
    metrics: Vec<ArchivedMetric>,
    index: HashMap<String, usize>,
    start: Option<SystemTime>,
    last_timestamp: Option<SystemTime>,
}

#[derive(Debug, Deserialize)]
struct Header {
    hostname: String,
    metrics: Vec<ArchivedMetric>,
}

#[derive(Debug, Deserialize)]
struct ArchivedMetric {
    name: String,
    kind: MetricKind,
    #[serde(default)]
    unit: Option<UnitSpec>,
    #[serde(default)]
    instances: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Record {
    timestamp_ms: u64,
    #[serde(default)]
    values: BTreeMap<String, ArchivedValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArchivedValue {
    Single(Option<RawValue>),
    Instances(BTreeMap<String, Option<RawValue>>),
}

impl ArchiveSource {
    /// Opens the archive at `path`; records before `start` are skipped.
    ///
    /// # Errors
    ///
    /// Errors when the file cannot be opened or its header is invalid.
    pub fn open(path: &Path, start: Option<SystemTime>) -> Result<Self, SourceError> {
        let file = File::open(path)
            .map_err(|source| SourceError::Open { path: path.to_path_buf(), source })?;

        Self::from_reader(BufReader::new(file), start)
    }

    /// Reads an archive from any buffered reader.
    ///
    /// # Errors
    ///
    /// Errors when the header is missing or invalid.
    pub fn from_reader<R>(reader: R, start: Option<SystemTime>) -> Result<Self, SourceError>
    where
        R: BufRead + Send + 'static,
    {
        let mut source = ArchiveSource {
            reader: Box::new(reader),
            line: 0,
            hostname: String::new(),
            metrics: Vec::new(),
            index: HashMap::default(),
            start,
            last_timestamp: None,
        };

        let (line, _) = source.next_line()?.ok_or(SourceError::MissingHeader)?;
        let header: Header = serde_json::from_str(&line)
            .map_err(|source_err| SourceError::Parse { line: source.line, source: source_err })?;

        source.hostname = header.hostname;
        for metric in header.metrics {
            let position = source.metrics.len();
            source.index.entry(metric.name.clone()).or_insert(position);
            source.metrics.push(metric);
        }

        Ok(source)
    }

    /// Next non-blank line and whether it was newline terminated.
    fn next_line(&mut self) -> Result<Option<(String, bool)>, SourceError> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line = self.line.saturating_add(1);

            let terminated = line.ends_with('\n');
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some((trimmed.to_string(), terminated)));
            }
        }
    }

    fn rows(&self, values: &BTreeMap<String, ArchivedValue>) -> Vec<Row> {
        let mut rows = Vec::new();

        for metric in &self.metrics {
            let Some(value) = values.get(&metric.name) else {
                continue;
            };

            match (&metric.instances, value) {
                (None, ArchivedValue::Single(value)) => rows.push(Row {
                    metric: metric.name.clone(),
                    instance: Instance::Null,
                    value: value.clone().ok_or(ValueError::Missing),
                }),
                (Some(instances), ArchivedValue::Instances(values)) => {
                    for (id, name) in instances.iter().enumerate() {
                        let Some(value) = values.get(name) else {
                            continue;
                        };

                        rows.push(Row {
                            metric: metric.name.clone(),
                            instance: Instance::id(u32::try_from(id).unwrap_or(u32::MAX), name),
                            value: value.clone().ok_or(ValueError::Missing),
                        });
                    }
                }
                _ => debug!(metric = %metric.name, "Archived value does not match instance domain"),
            }
        }

        rows
    }
}

impl Source for ArchiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Archive
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn resolve(&self, name: &str) -> Result<ResolvedMetric, SourceError> {
        let metric = self
            .index
            .get(name)
            .map(|&position| &self.metrics[position])
            .ok_or_else(|| SourceError::UnknownMetric(name.to_string()))?;

        let domain = match &metric.instances {
            None => InstanceDomain::Singular,
            Some(instances) => InstanceDomain::Fixed(
                instances
                    .iter()
                    .enumerate()
                    .map(|(id, name)| Instance::id(u32::try_from(id).unwrap_or(u32::MAX), name))
                    .collect(),
            ),
        };

        Ok(ResolvedMetric {
            name: metric.name.clone(),
            kind: metric.kind,
            unit: metric.unit,
            domain,
        })
    }

    fn fetch(&mut self) -> Result<Fetch, SourceError> {
        loop {
            let Some((line, terminated)) = self.next_line()? else {
                return Ok(Fetch::EndOfData);
            };

            let record: Record = match serde_json::from_str(&line) {
                Ok(record) => record,
                // A partially written final record marks the end of the log.
                Err(_) if !terminated => return Err(SourceError::EndOfLog),
                Err(source) => return Err(SourceError::Parse { line: self.line, source }),
            };

            let timestamp = UNIX_EPOCH + Duration::from_millis(record.timestamp_ms);
            if self.start.is_some_and(|start| timestamp < start) {
                continue;
            }

            self.last_timestamp = Some(timestamp);

            return Ok(Fetch::Sample(Sample { timestamp, rows: self.rows(&record.values) }));
        }
    }

    fn last_timestamp(&self) -> Option<SystemTime> {
        self.last_timestamp
    }
}
