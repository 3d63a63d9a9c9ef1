//! Remote-write client
//!
//! The [`Writer`] turns raw query results into remote-write series and ships
//! them to the receiver. Bodies are protobuf [`WriteRequest`] messages
//! compressed with snappy's raw block format. Series are sent in batches of
//! at most `batch_size`, a failed batch is never retried and stops the
//! batches after it.

use std::{num::NonZeroU32, time::Duration};

use http::Uri;
use metrics::counter;
use prost::Message;
use promfire_signal::Watcher;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tracing::{debug, trace};

use crate::{
    api::truncated,
    labels::LabelSet,
    proto::prometheus::{Label, Sample, TimeSeries, WriteRequest},
    query::RawSample,
    timestamp::{SystemClock, TimestampCoordinator, WallClock},
};

/// Timeout applied to every remote-write request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const REMOTE_WRITE_VERSION_HEADER: &str = "X-Prometheus-Remote-Write-Version";
const REMOTE_WRITE_VERSION: &str = "0.1.0";

/// Errors produced by [`Writer`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] Box<reqwest::Error>),
    /// Every raw sample of a series was malformed.
    #[error("None of {points} raw samples converted to a valid sample")]
    NoValidSamples {
        /// Raw samples examined
        points: usize,
    },
    /// Snappy compression failed.
    #[error("Failed to compress request body: {0}")]
    Compress(#[from] snap::Error),
    /// Sending a batch failed at the transport layer.
    #[error("Failed to send series [{start}, {end}): {source}")]
    Request {
        /// Index of the first series of the batch
        start: usize,
        /// Index one past the last series of the batch
        end: usize,
        /// Underlying reqwest error
        #[source]
        source: Box<reqwest::Error>,
    },
    /// The receiver rejected a batch.
    #[error("Receiver rejected series [{start}, {end}) with status {status}: {body}")]
    Status {
        /// Index of the first series of the batch
        start: usize,
        /// Index one past the last series of the batch
        end: usize,
        /// HTTP status code
        status: u16,
        /// Leading portion of the response body
        body: String,
    },
    /// A batch was abandoned because the run was cancelled.
    #[error("Sending series [{start}, {end}) abandoned due to shutdown")]
    Shutdown {
        /// Index of the first series of the batch
        start: usize,
        /// Index one past the last series of the batch
        end: usize,
    },
}

impl Error {
    /// Whether this error is the result of run cancellation.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown { .. })
    }
}

/// Interpret one raw `[timestamp, value]` pair, returning its value.
///
/// The pair must have exactly two elements and the value must be a string or
/// number holding a finite float. The source timestamp is ignored.
#[must_use]
pub fn parse_value(raw: &RawSample) -> Option<f64> {
    let [_, value] = raw.as_slice() else {
        return None;
    };
    let value = match value {
        serde_json::Value::String(text) => text.trim().parse::<f64>().ok()?,
        serde_json::Value::Number(number) => number.as_f64()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

/// Remote-write client.
#[derive(Debug)]
pub struct Writer<C = SystemClock> {
    client: reqwest::Client,
    url: String,
    batch_size: usize,
    timestamps: TimestampCoordinator<C>,
}

impl Writer<SystemClock> {
    /// Create a new [`Writer`] posting to `remote_write_url`, stamping samples
    /// from the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(remote_write_url: &Uri, batch_size: NonZeroU32) -> Result<Self, Error> {
        Self::with_clock(remote_write_url, batch_size, SystemClock)
    }
}

impl<C> Writer<C>
where
    C: WallClock,
{
    /// Create a new [`Writer`] stamping samples from `clock`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn with_clock(
        remote_write_url: &Uri,
        batch_size: NonZeroU32,
        clock: C,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::Client(Box::new(err)))?;
        Ok(Self {
            client,
            url: remote_write_url.to_string(),
            batch_size: usize::try_from(batch_size.get()).unwrap_or(usize::MAX),
            timestamps: TimestampCoordinator::with_clock(clock),
        })
    }

    /// Build a series from `labels` and the raw `values` of a query result.
    ///
    /// Malformed values are dropped. Every kept sample is stamped with a fresh
    /// run-wide timestamp in place of its source timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoValidSamples`] if no value survives conversion.
    pub fn convert(&self, labels: &LabelSet, values: &[RawSample]) -> Result<TimeSeries, Error> {
        let samples: Vec<Sample> = values
            .iter()
            .filter_map(parse_value)
            .map(|value| Sample {
                value,
                timestamp: self.timestamps.next_timestamp(),
            })
            .collect();

        let dropped = values.len() - samples.len();
        if dropped > 0 {
            trace!(dropped, "Dropped malformed samples");
            counter!("samples_dropped").increment(dropped as u64);
        }
        if samples.is_empty() {
            return Err(Error::NoValidSamples {
                points: values.len(),
            });
        }

        Ok(TimeSeries {
            labels: labels
                .iter()
                .map(|(name, value)| Label {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            samples,
        })
    }

    /// Convert and send one series, returning the number of samples written.
    ///
    /// # Errors
    ///
    /// See [`Writer::convert`] and [`Writer::write_batch`].
    pub async fn write(
        &self,
        labels: &LabelSet,
        values: &[RawSample],
        shutdown: &mut Watcher,
    ) -> Result<usize, Error> {
        let series = self.convert(labels, values)?;
        let samples = series.samples.len();
        self.write_batch(vec![series], shutdown).await?;
        Ok(samples)
    }

    /// Send `series` in batches of at most `batch_size`, in order.
    ///
    /// # Errors
    ///
    /// The first batch to fail is reported with its `[start, end)` range and
    /// no later batch is sent. Batches already sent are unaffected.
    pub async fn write_batch(
        &self,
        series: Vec<TimeSeries>,
        shutdown: &mut Watcher,
    ) -> Result<(), Error> {
        let mut remaining = series.into_iter();
        let mut start = 0;
        loop {
            let batch: Vec<TimeSeries> = remaining.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                return Ok(());
            }
            let end = start + batch.len();
            if let Err(err) = self.send(batch, start, end, shutdown).await {
                if !err.is_shutdown() {
                    counter!("batch_failure").increment(1);
                }
                return Err(err);
            }
            start = end;
        }
    }

    async fn send(
        &self,
        timeseries: Vec<TimeSeries>,
        start: usize,
        end: usize,
        shutdown: &mut Watcher,
    ) -> Result<(), Error> {
        let samples: usize = timeseries.iter().map(|series| series.samples.len()).sum();
        let encoded = WriteRequest { timeseries }.encode_to_vec();
        let body = snap::raw::Encoder::new().compress_vec(&encoded)?;
        let bytes = body.len();

        let request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(CONTENT_ENCODING, "snappy")
            .header(REMOTE_WRITE_VERSION_HEADER, REMOTE_WRITE_VERSION)
            .body(body)
            .send();

        // An error body is read under the same cancellation as the request.
        let exchange = async {
            let response = match request.await {
                Ok(response) => response,
                Err(source) => {
                    return Err(Error::Request {
                        start,
                        end,
                        source: Box::new(source),
                    });
                }
            };
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let body = response.bytes().await.unwrap_or_default();
            Err(Error::Status {
                start,
                end,
                status: status.as_u16(),
                body: truncated(&body),
            })
        };

        tokio::select! {
            biased;

            () = shutdown.recv() => return Err(Error::Shutdown { start, end }),
            res = exchange => res?,
        }

        debug!(start, end, samples, bytes, "Sent batch");
        counter!("batches_sent").increment(1);
        counter!("series_written").increment((end - start) as u64);
        counter!("samples_written").increment(samples as u64);
        counter!("bytes_written").increment(bytes as u64);
        Ok(())
    }
}
