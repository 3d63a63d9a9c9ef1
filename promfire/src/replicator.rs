//! The replication pipeline
//!
//! A [`Replicator`] discovers every metric the backend knows, drops the
//! excluded ones, reads each remaining metric back over the query window and
//! writes every returned series once per replica label combination. Writes
//! are paced by a shared [`RateLimiter`].
//!
//! Failures are contained to the smallest unit they affect. A metric whose
//! query fails is skipped, a series whose write fails is counted and its
//! remaining replicas abandoned. Only discovery failure and cancellation end
//! the run early.

use std::ops::AddAssign;

use futures::{StreamExt, stream};
use metrics::counter;
use promfire_signal::Watcher;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    api::{self, Api},
    catalog::{self, ExcludeFilter},
    config::{Benchmark, Config},
    labels::{self, LabelSet, METRIC_NAME_LABEL},
    query::{self, RawSample, SeriesResult, Window},
    rate::{self, RateLimiter},
    writer::{self, Writer},
};

/// Errors produced by [`Replicator`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The query API client could not be constructed.
    #[error(transparent)]
    Api(#[from] api::Error),
    /// The remote-write client could not be constructed.
    #[error(transparent)]
    Writer(#[from] writer::Error),
    /// Metric discovery failed, there is nothing to replicate.
    #[error(transparent)]
    Discovery(#[from] catalog::Error),
    /// The run was cancelled.
    #[error("Replication cancelled")]
    Shutdown,
}

/// Failure replicating one series.
#[derive(thiserror::Error, Debug)]
enum SeriesError {
    #[error(transparent)]
    Rate(#[from] rate::Error),
    #[error(transparent)]
    Write(#[from] writer::Error),
}

impl SeriesError {
    fn is_shutdown(&self) -> bool {
        match self {
            SeriesError::Rate(rate::Error::Shutdown) => true,
            SeriesError::Rate(_) => false,
            SeriesError::Write(err) => err.is_shutdown(),
        }
    }
}

/// Tally of one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Metric names reported by the backend
    pub metrics_discovered: u64,
    /// Metric names left after exclusion
    pub metrics_selected: u64,
    /// Metrics whose range query failed
    pub metrics_failed: u64,
    /// Series returned by range queries
    pub series_seen: u64,
    /// Replicas written, or reported in a dry run
    pub series_replicated: u64,
    /// Series whose replication failed
    pub series_failed: u64,
    /// Samples accepted by the receiver
    pub samples_written: u64,
}

impl AddAssign for Summary {
    fn add_assign(&mut self, rhs: Self) {
        self.metrics_discovered += rhs.metrics_discovered;
        self.metrics_selected += rhs.metrics_selected;
        self.metrics_failed += rhs.metrics_failed;
        self.series_seen += rhs.series_seen;
        self.series_replicated += rhs.series_replicated;
        self.series_failed += rhs.series_failed;
        self.samples_written += rhs.samples_written;
    }
}

/// Drives one replication run.
#[derive(Debug)]
pub struct Replicator {
    api: Api,
    exclude: ExcludeFilter,
    /// Absent in a dry run.
    writer: Option<Writer>,
    limiter: RateLimiter,
    combinations: Vec<LabelSet>,
    benchmark: Benchmark,
    shutdown: Watcher,
}

impl Replicator {
    /// Create a new [`Replicator`] from `config`.
    ///
    /// With `dry_run` no remote-write client is built and nothing is written,
    /// every replica that would have been sent is logged instead.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be constructed.
    pub fn new(config: &Config, dry_run: bool, shutdown: Watcher) -> Result<Self, Error> {
        let api = Api::new(&config.prometheus.query_url)?;
        let (exclude, _) = ExcludeFilter::compile(&config.exclude_metrics);
        let writer = if dry_run {
            info!("Dry run, nothing will be written");
            None
        } else {
            Some(Writer::new(
                &config.prometheus.remote_write_url,
                config.benchmark.batch_size,
            )?)
        };
        let replication_factor =
            usize::try_from(config.benchmark.replication_factor.get()).unwrap_or(usize::MAX);
        let combinations = labels::combine(&config.replication_labels, replication_factor);
        debug!(
            combinations = combinations.len(),
            "Computed replica label combinations"
        );

        Ok(Self {
            api,
            exclude,
            writer,
            limiter: RateLimiter::new(config.benchmark.samples_per_second),
            combinations,
            benchmark: config.benchmark,
            shutdown,
        })
    }

    /// Run the pipeline to completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the metric catalog cannot be read and
    /// [`Error::Shutdown`] if the run is cancelled. Every other failure is
    /// logged, tallied in the returned [`Summary`] and skipped.
    pub async fn run(&self) -> Result<Summary, Error> {
        let mut shutdown = self.shutdown.clone();
        let names = match catalog::discover(&self.api, &mut shutdown).await {
            Ok(names) => names,
            Err(err) if err.is_shutdown() => return Err(Error::Shutdown),
            Err(err) => return Err(err.into()),
        };

        let mut summary = Summary {
            metrics_discovered: names.len() as u64,
            ..Summary::default()
        };
        let selected = self.exclude.filter(names);
        summary.metrics_selected = selected.len() as u64;
        info!(
            discovered = summary.metrics_discovered,
            selected = summary.metrics_selected,
            replicas = self.combinations.len(),
            "Starting replication"
        );

        let window = Window::ending_now(
            self.benchmark.query_range_hours.get(),
            self.benchmark.query_step_seconds.get(),
        );
        let mut outcomes = stream::iter(selected)
            .map(|metric| self.process_metric(metric, window))
            .buffer_unordered(usize::from(self.benchmark.parallel_metrics.get()));
        while let Some(outcome) = outcomes.next().await {
            summary += outcome?;
        }

        info!(
            metrics_discovered = summary.metrics_discovered,
            metrics_selected = summary.metrics_selected,
            metrics_failed = summary.metrics_failed,
            series_seen = summary.series_seen,
            series_replicated = summary.series_replicated,
            series_failed = summary.series_failed,
            samples_written = summary.samples_written,
            "Replication complete"
        );
        Ok(summary)
    }

    async fn process_metric(&self, metric: String, window: Window) -> Result<Summary, Error> {
        let span = info_span!("metric", metric_name = %metric);
        async move {
            let mut shutdown = self.shutdown.clone();
            if shutdown.try_recv() {
                return Err(Error::Shutdown);
            }

            let mut summary = Summary::default();
            let series = match query::query_range(&self.api, &metric, &window, &mut shutdown).await
            {
                Ok(series) => series,
                Err(err) if err.is_shutdown() => return Err(Error::Shutdown),
                Err(err) => {
                    warn!(error = %err, "Skipping metric");
                    counter!("metrics_failed").increment(1);
                    summary.metrics_failed += 1;
                    return Ok(summary);
                }
            };
            if series.is_empty() {
                debug!("No series returned, nothing to replicate");
                return Ok(summary);
            }

            for result in &series {
                summary.series_seen += 1;
                self.replicate_series(&metric, result, &mut shutdown, &mut summary)
                    .await?;
            }
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn replicate_series(
        &self,
        metric: &str,
        result: &SeriesResult,
        shutdown: &mut Watcher,
        summary: &mut Summary,
    ) -> Result<(), Error> {
        let mut base = result.metric.clone();
        base.entry(METRIC_NAME_LABEL.to_string())
            .or_insert_with(|| metric.to_string());

        for combination in &self.combinations {
            let labels = labels::merge(&base, combination);
            let Some(writer) = &self.writer else {
                info!(
                    labels = ?labels,
                    samples = result.values.len(),
                    "DRY RUN: Would replicate series"
                );
                summary.series_replicated += 1;
                continue;
            };

            match self
                .send_samples(writer, &labels, &result.values, shutdown)
                .await
            {
                Ok(written) => {
                    counter!("series_replicated").increment(1);
                    summary.series_replicated += 1;
                    summary.samples_written += written as u64;
                }
                Err(err) if err.is_shutdown() => return Err(Error::Shutdown),
                Err(err) => {
                    warn!(
                        error = %err,
                        labels = ?labels,
                        "Failed to replicate series, skipping its remaining replicas"
                    );
                    counter!("series_failed").increment(1);
                    summary.series_failed += 1;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Write `values` in chunks no larger than the limiter's burst, waiting
    /// for capacity before each chunk.
    async fn send_samples(
        &self,
        writer: &Writer,
        labels: &LabelSet,
        values: &[RawSample],
        shutdown: &mut Watcher,
    ) -> Result<usize, SeriesError> {
        let chunk_size = usize::try_from(self.limiter.burst().get()).unwrap_or(usize::MAX);
        let mut written = 0;
        for (index, chunk) in values.chunks(chunk_size).enumerate() {
            self.limiter.acquire(chunk.len(), shutdown).await?;
            match writer.write(labels, chunk, shutdown).await {
                Ok(samples) => written += samples,
                // A chunk of malformed values is not fatal while others in the
                // series convert.
                Err(writer::Error::NoValidSamples { points }) => {
                    debug!(chunk = index, points, "Skipping chunk without valid samples");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if written == 0 {
            return Err(writer::Error::NoValidSamples {
                points: values.len(),
            }
            .into());
        }
        Ok(written)
    }
}
