//! Metric sources the sampler pulls snapshots from.

mod archive;
mod live_storage;
mod recorder;

use std::path::PathBuf;
use std::time::SystemTime;

pub use archive::ArchiveSource;
pub use recorder::{IndexRecorder, RecorderSource};
use thiserror::Error;

use crate::metric::{Instance, MetricKind, Sample};
use crate::scale::UnitSpec;

/// Whether a source is sampled live or replayed from history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Values are read at the moment of the fetch; the sampler paces fetches to the interval.
    Live,
    /// Values come from a bounded log and are replayed as fast as they can be read.
    Archive,
}

impl SourceKind {
    /// Whether the sampler interpolates to wall-clock interval edges.
    #[must_use]
    pub const fn interpolates(self) -> bool {
        matches!(self, SourceKind::Live)
    }
}

/// Instances a metric can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceDomain {
    /// Single-valued metric.
    Singular,
    /// Known, fixed set of instances.
    Fixed(Vec<Instance>),
    /// Instances appear as they are recorded; not known up front.
    Dynamic,
}

/// Source-side description of a metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMetric {
    pub name: String,
    pub kind: MetricKind,
    pub unit: Option<UnitSpec>,
    pub domain: InstanceDomain,
}

/// Result of asking a source for its next snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch {
    Sample(Sample),
    /// No further samples exist.
    EndOfData,
}

/// Provider of metric snapshots.
pub trait Source {
    fn kind(&self) -> SourceKind;

    /// Host the metrics describe.
    fn hostname(&self) -> String;

    /// Describes `name`.
    ///
    /// # Errors
    ///
    /// Errors with [`SourceError::UnknownMetric`] when the source has no such metric.
    fn resolve(&self, name: &str) -> Result<ResolvedMetric, SourceError>;

    /// Fetches the next snapshot.
    ///
    /// # Errors
    ///
    /// Errors when the source fails; [`SourceError::EndOfLog`] is an end-of-data signal.
    fn fetch(&mut self) -> Result<Fetch, SourceError>;

    /// Timestamp of the most recent successful fetch.
    fn last_timestamp(&self) -> Option<SystemTime>;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Unknown metric; name={0}")]
    UnknownMetric(String),
    #[error("End of log")]
    EndOfLog,
    #[error("Open archive; path={path:?}; err={source}")]
    Open { path: PathBuf, source: std::io::Error },
    #[error("Read archive; err={0}")]
    Read(#[from] std::io::Error),
    #[error("Archive has no header")]
    MissingHeader,
    #[error("Parse archive; line={line}; err={source}")]
    Parse { line: u64, source: serde_json::Error },
}

impl SourceError {
    /// Whether the error signals the end of a bounded source rather than a failure.
    #[must_use]
    pub const fn is_end_of_data(&self) -> bool {
        matches!(self, SourceError::EndOfLog)
    }
}
