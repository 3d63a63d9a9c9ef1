//! Prometheus HTTP API client
//!
//! Both metric discovery and range queries speak the Prometheus JSON API:
//! every response is wrapped in an envelope carrying a `status` field which
//! must read `"success"` for `data` to be meaningful. This module owns the
//! HTTP client, the envelope and the failure taxonomy shared by
//! [`crate::catalog`] and [`crate::query`].

use std::time::Duration;

use http::Uri;
use serde::{Deserialize, de::DeserializeOwned};
use tracing::trace;

/// Timeout applied to every request made against the query API.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Error bodies are echoed into logs, keep them bounded.
const MAX_ERROR_BODY: usize = 512;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Api`].
pub enum Error {
    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] Box<reqwest::Error>),
    /// The request failed at the transport layer.
    #[error("Failed to send request to {url}: {source}")]
    Request {
        /// Request URL
        url: String,
        /// Underlying reqwest error
        #[source]
        source: Box<reqwest::Error>,
    },
    /// The server answered with a status outside of 2xx.
    #[error("Request to {url} failed with status {status}: {body}")]
    Status {
        /// Request URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Leading portion of the response body
        body: String,
    },
    /// The response body was not the expected JSON.
    #[error("Failed to parse response from {url}: {source}")]
    Decode {
        /// Request URL
        url: String,
        /// Underlying JSON error
        #[source]
        source: serde_json::Error,
    },
    /// The response envelope did not report success.
    #[error("Query against {url} returned status {status}: {error}")]
    Unsuccessful {
        /// Request URL
        url: String,
        /// The `status` field of the envelope
        status: String,
        /// The `error` field of the envelope, if any
        error: String,
    },
    /// The request was abandoned because the run was cancelled.
    #[error("Request to {url} abandoned due to shutdown")]
    Shutdown {
        /// Request URL
        url: String,
    },
}

impl Error {
    /// Whether this error is the result of run cancellation rather than a
    /// failure of the backend.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown { .. })
    }
}

/// The JSON envelope wrapping every Prometheus API response.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the Prometheus query API rooted at `query_url`.
#[derive(Debug, Clone)]
pub struct Api {
    client: reqwest::Client,
    base_url: String,
}

impl Api {
    /// Create a new [`Api`] instance against `query_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built, for
    /// instance when the TLS backend fails to initialize.
    pub fn new(query_url: &Uri) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::Client(Box::new(err)))?;
        Ok(Self {
            client,
            base_url: query_url.to_string().trim_end_matches('/').to_string(),
        })
    }

    /// The absolute URL for `path` below the query root.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Issue a GET against `path` with `params` and decode the `data` member
    /// of a successful envelope.
    ///
    /// The request is abandoned as soon as `shutdown` fires.
    pub(crate) async fn get<T>(
        &self,
        path: &str,
        params: &[(&str, String)],
        shutdown: &mut promfire_signal::Watcher,
    ) -> Result<T, Error>
    where
        T: DeserializeOwned + Default,
    {
        let url = self.url(path);
        let request = async {
            let response = self
                .client
                .get(&url)
                .query(params)
                .send()
                .await
                .map_err(|source| Error::Request {
                    url: url.clone(),
                    source: Box::new(source),
                })?;
            let status = response.status();
            let body = response.bytes().await.map_err(|source| Error::Request {
                url: url.clone(),
                source: Box::new(source),
            })?;
            trace!("{url} answered {status} with {len} bytes", len = body.len());

            if !status.is_success() {
                return Err(Error::Status {
                    url: url.clone(),
                    status: status.as_u16(),
                    body: truncated(&body),
                });
            }

            let envelope: Envelope<T> =
                serde_json::from_slice(&body).map_err(|source| Error::Decode {
                    url: url.clone(),
                    source,
                })?;
            if envelope.status != "success" {
                return Err(Error::Unsuccessful {
                    url: url.clone(),
                    status: envelope.status,
                    error: envelope.error.unwrap_or_else(|| truncated(&body)),
                });
            }
            Ok(envelope.data.unwrap_or_default())
        };

        tokio::select! {
            biased;

            () = shutdown.recv() => Err(Error::Shutdown { url: url.clone() }),
            result = request => result,
        }
    }
}

pub(crate) fn truncated(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    }
}
