//! Samples metrics from a [`Source`] and writes them as nested JSON documents
//! into an Elasticsearch compatible index.
//!
//! Live metrics come from the in-process [`IndexRecorder`]: install it, let the
//! application describe or register its metrics, then [`spawn`] a sampler over
//! a [`RecorderSource`].

pub mod config;
pub mod document;
pub mod metric;
pub mod rate;
pub mod registry;
pub mod sampler;
pub mod scale;
pub mod sink;
pub mod source;

use std::thread::JoinHandle;

use metrics::SetRecorderError;
use thiserror::Error;
pub use tokio_util::sync::CancellationToken;

pub use crate::config::Config;
use crate::config::ConfigError;
use crate::registry::RegistryError;
pub use crate::sampler::{describe_exporter_metrics, runtime, RunReport, Sampler};
use crate::sink::{ElasticClient, SinkError};
pub use crate::source::{ArchiveSource, IndexRecorder, RecorderSource, Source};
use crate::source::SourceError;

/// Installs the global metrics recorder.
///
/// # Returns
///
/// Returns a handle to the recorder for use with [`RecorderSource`].
///
/// # Errors
///
/// Errors if a global recorder is already installed.
pub fn install() -> Result<IndexRecorder, InstallError> {
    IndexRecorder::install().map_err(Into::into)
}

/// Samples `source` into the configured index on a dedicated thread.
///
/// # Returns
///
/// Returns a [`JoinHandle`] to the sampler thread.
///
/// # Errors
///
/// Errors if the sampler thread cannot be started.
pub fn spawn<S>(
    cxl: CancellationToken,
    config: Config,
    source: S,
) -> Result<JoinHandle<Result<RunReport, Error>>, Error>
where
    S: Source + Send + 'static,
{
    Sampler::<S, ElasticClient>::spawn(cxl, config, source)
}

/// Possible failure while installing the recorder.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Failed to set the global metrics recorder.
    #[error("Set recorder; err={0}")]
    SetRecorder(#[from] SetRecorderError<IndexRecorder>),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error("Build runtime; err={0}")]
    Runtime(std::io::Error),
    #[error("Spawn sampler; err={0}")]
    Spawn(std::io::Error),
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    #[test]
    fn io_errors_name_their_stage() {
        expect!["Build runtime; err=no threads"]
            .assert_eq(&Error::Runtime(std::io::Error::other("no threads")).to_string());
        expect!["Spawn sampler; err=no threads"]
            .assert_eq(&Error::Spawn(std::io::Error::other("no threads")).to_string());
    }
}
