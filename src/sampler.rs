use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use metrics::Unit;
use tokio::runtime::Runtime;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::document::{self, BuildStats};
use crate::metric::Sample;
use crate::rate::CounterRates;
use crate::registry::MetricRegistry;
use crate::sink::{Delivery, ElasticClient, IndexClient, SinkAdapter};
use crate::source::{Fetch, Source};
use crate::Error;

pub const DOCUMENTS_SENT: &str = "exporter.documents.sent";
pub const DOCUMENTS_DROPPED: &str = "exporter.documents.dropped";
pub const TICK_DURATION: &str = "exporter.tick.duration";

/// Describes the sampler's own metrics so a live source can resolve them before first use.
pub fn describe_exporter_metrics() {
    metrics::describe_counter!(DOCUMENTS_SENT, Unit::Count, "Documents stored in the index");
    metrics::describe_counter!(DOCUMENTS_DROPPED, Unit::Count, "Documents lost to sink failures");
    metrics::describe_histogram!(
        TICK_DURATION,
        Unit::Seconds,
        "Time to shape and send one sample"
    );
}

/// Lifecycle of a sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    /// Metrics were validated in check mode; nothing is sampled.
    Checked,
    Running,
    /// One final flush tick remains.
    Draining,
    Stopped,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Samples shaped into documents.
    pub ticks: u64,
    pub sent: u64,
    pub dropped: u64,
    /// Whether the final flush tick ran.
    pub flushed: bool,
}

/// Drives fetch, shape and transmit ticks from a [`Source`] into an [`IndexClient`].
pub struct Sampler<S, C> {
    cxl: CancellationToken,
    config: Config,

    source: S,
    sink: SinkAdapter<C>,
    registry: MetricRegistry,
    rates: CounterRates,
    host_id: String,
    remaining: Option<u64>,
    state: State,
    report: RunReport,
}

impl<S> Sampler<S, ElasticClient>
where
    S: Source + Send + 'static,
{
    /// Runs the sampler on a dedicated thread with its own runtime.
    ///
    /// # Errors
    ///
    /// Errors if the runtime or the thread cannot be created.
    pub(crate) fn spawn(
        cxl: CancellationToken,
        config: Config,
        source: S,
    ) -> Result<JoinHandle<Result<RunReport, Error>>, Error> {
        let runtime = runtime()?;

        std::thread::Builder::new()
            .name("MetricsIndex".to_string())
            .spawn(move || {
                let sampler = {
                    let _guard = runtime.enter();
                    let client = ElasticClient::new(&config.sink)?;
                    Sampler::setup(cxl, config, source, client)?
                };

                runtime.block_on(sampler.run())
            })
            .map_err(Error::Spawn)
    }
}

/// Builds the current-thread runtime the sampler runs on.
///
/// # Errors
///
/// Errors if the runtime cannot be created.
pub fn runtime() -> Result<Runtime, Error> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)
}

impl<S, C> Sampler<S, C>
where
    S: Source,
    C: IndexClient,
{
    /// Resolves the configured metrics against `source`.
    ///
    /// # Errors
    ///
    /// Errors when the configuration or the metrics cannot be validated.
    pub fn setup(
        cxl: CancellationToken,
        config: Config,
        source: S,
        client: C,
    ) -> Result<Self, Error> {
        config.validate()?;
        let registry = MetricRegistry::validate(&config, &source)?;
        let host_id = config.sink.host_id.clone().unwrap_or_else(|| source.hostname());
        let remaining = match (config.samples, config.finish) {
            (Some(samples), _) => Some(samples),
            (None, Some(finish)) if source.kind().interpolates() => {
                Some(live_budget(finish, SystemTime::now(), config.interval))
            }
            (None, _) => None,
        };
        let sink = SinkAdapter::new(client, config.sink.index.clone());

        Ok(Sampler {
            cxl,
            config,

            source,
            sink,
            registry,
            rates: CounterRates::default(),
            host_id,
            remaining,
            state: State::Init,
            report: RunReport::default(),
        })
    }

    #[must_use]
    pub const fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    #[must_use]
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Samples until the budget is spent, the source ends, or the run is cancelled.
    ///
    /// # Errors
    ///
    /// Errors when the source fails with anything but an end of data.
    pub async fn run(mut self) -> Result<RunReport, Error> {
        if self.config.header {
            self.banner();
        }
        if self.config.check {
            self.transition(State::Checked);

            return Ok(self.report);
        }

        self.transition(State::Running);
        let pacing = self.source.kind().interpolates();
        if pacing {
            if let Some(align) = self.config.align {
                tokio::select! {
                    biased;

                    () = self.cxl.cancelled() => {},
                    () = tokio::time::sleep(until_aligned(SystemTime::now(), align)) => {},
                }
            }
        }

        // Archives replay as fast as they are read.
        let period = self.config.interval;
        let mut interval = pacing.then(|| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            interval
        });

        while self.state == State::Running {
            if self.cxl.is_cancelled() || self.remaining == Some(0) {
                self.transition(State::Draining);
                continue;
            }

            let sample = match self.source.fetch() {
                Ok(Fetch::Sample(sample)) => sample,
                Ok(Fetch::EndOfData) => {
                    self.transition(State::Draining);
                    continue;
                }
                Err(err) if err.is_end_of_data() => {
                    debug!(%err, "Source ended");
                    self.transition(State::Draining);
                    continue;
                }
                Err(err) => {
                    self.transition(State::Stopped);

                    return Err(err.into());
                }
            };

            // Replayed history past the window ends the run.
            if !pacing && self.config.finish.is_some_and(|finish| sample.timestamp > finish) {
                self.transition(State::Draining);
                continue;
            }

            self.tick(sample).await;
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
            }

            if let Some(interval) = interval.as_mut().filter(|_| self.remaining != Some(0)) {
                tokio::select! {
                    biased;

                    () = self.cxl.cancelled() => {},
                    _ = interval.tick() => {},
                }
            }
        }

        self.report.flushed = self.sink.report(None).await == Delivery::Flushed;
        self.transition(State::Stopped);

        Ok(self.report)
    }

    #[allow(clippy::arithmetic_side_effects)]
    async fn tick(&mut self, mut sample: Sample) {
        let start = std::time::Instant::now();
        let registry = &self.registry;
        self.rates.apply(&mut sample, |metric| registry.is_rate(metric));

        let (document, stats) = document::build(&sample, &self.registry, &self.host_id);
        if stats != BuildStats::default() {
            debug!(stats.skipped_rows, stats.failed_metrics, "Shaped document with omissions");
        }

        self.report.ticks += 1;
        match self.sink.report(Some(&document)).await {
            Delivery::Sent => {
                self.report.sent += 1;
                metrics::counter!(DOCUMENTS_SENT).increment(1);
            }
            Delivery::Dropped => {
                self.report.dropped += 1;
                metrics::counter!(DOCUMENTS_DROPPED).increment(1);
            }
            Delivery::Flushed => {}
        }
        metrics::histogram!(TICK_DURATION).record(start.elapsed().as_secs_f64());
    }

    fn transition(&mut self, state: State) {
        debug!(from = ?self.state, to = ?state, "Sampler state");
        self.state = state;
    }

    fn banner(&self) {
        if !self.source.kind().interpolates() {
            info!(
                metrics = self.registry.len(),
                server = %self.config.sink.server,
                index = %self.sink.index(),
                host = %self.host_id,
                "Sending archived metrics"
            );

            return;
        }

        let interval = humantime::format_duration(self.config.interval);
        match self.remaining.and_then(|samples| expected_runtime(samples, self.config.interval)) {
            Some(runtime) => info!(
                metrics = self.registry.len(),
                server = %self.config.sink.server,
                index = %self.sink.index(),
                host = %self.host_id,
                %interval,
                runtime = %humantime::format_duration(runtime),
                "Sending metrics"
            ),
            None => info!(
                metrics = self.registry.len(),
                server = %self.config.sink.server,
                index = %self.sink.index(),
                host = %self.host_id,
                %interval,
                "Sending metrics"
            ),
        }
    }
}

/// Wall-clock span of `samples` paced samples; the first one is taken immediately.
fn expected_runtime(samples: u64, interval: Duration) -> Option<Duration> {
    let gaps = u32::try_from(samples.checked_sub(1)?).unwrap_or(u32::MAX);

    Some(interval.saturating_mul(gaps))
}

/// Samples that fit between `now` and `finish`, counting the first one at `now`.
fn live_budget(finish: SystemTime, now: SystemTime, interval: Duration) -> u64 {
    let Ok(left) = finish.duration_since(now) else {
        return 0;
    };
    let fits = left.as_nanos().checked_div(interval.as_nanos()).unwrap_or(0);

    u64::try_from(fits).unwrap_or(u64::MAX).saturating_add(1)
}

/// Time from `now` until the next wall-clock multiple of `align`.
fn until_aligned(now: SystemTime, align: Duration) -> Duration {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let Some(offset) = since_epoch.checked_rem(align.as_nanos()) else {
        return Duration::ZERO;
    };
    if offset == 0 {
        return Duration::ZERO;
    }

    let wait = align.as_nanos().saturating_sub(offset);

    Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX))
}
