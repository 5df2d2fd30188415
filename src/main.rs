mod cli;

use std::process::ExitCode;

use clap::Parser;
use metrics_index_exporter::config::SourceConfig;
use metrics_index_exporter::sink::ElasticClient;
use metrics_index_exporter::{
    ArchiveSource, CancellationToken, Config, Error, RecorderSource, RunReport, Sampler, Source,
};
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::cli::Args;

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();

            // Help and version are not failures.
            return match err.use_stderr() {
                true => ExitCode::FAILURE,
                false => ExitCode::SUCCESS,
            };
        }
    };

    init_tracing(&args.log_level);

    match run(args) {
        Ok(report) => {
            info!(report.ticks, report.sent, report.dropped, "Finished");

            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "Exiting");

            ExitCode::FAILURE
        }
    }
}

/// Logs to stderr, filtered by `RUST_LOG` or else `default_filter`.
fn init_tracing(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn run(args: Args) -> Result<RunReport, Error> {
    let config = args.into_config()?;
    metrics_index_exporter::runtime()?.block_on(start(config))
}

async fn start(config: Config) -> Result<RunReport, Error> {
    let cxl = CancellationToken::new();
    let client = ElasticClient::new(&config.sink)?;

    match config.source.clone() {
        SourceConfig::Archive(path) => {
            let source = ArchiveSource::open(&path, config.start)?;

            sample(cxl, config, source, client).await
        }
        SourceConfig::Live => {
            let recorder = metrics_index_exporter::install()?;
            metrics_index_exporter::describe_exporter_metrics();

            sample(cxl, config, RecorderSource::new(recorder), client).await
        }
    }
}

async fn sample<S>(
    cxl: CancellationToken,
    config: Config,
    source: S,
    client: ElasticClient,
) -> Result<RunReport, Error>
where
    S: Source,
{
    let check = config.check;
    let sampler = Sampler::setup(cxl.clone(), config, source, client)?;
    if check {
        print!("{}", sampler.registry().table());
    }

    // Interrupts drain the sampler instead of killing it.
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, draining");
            cxl.cancel();
        }
    });

    let report = sampler.run().await;
    signal.abort();

    report
}
