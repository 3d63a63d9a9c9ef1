//! Historical range queries
//!
//! Each metric selected for replication is read back over the query window
//! with a single `query_range` call. Values are kept exactly as the backend
//! returned them, conversion to samples happens in [`crate::writer`].

use std::time::{SystemTime, UNIX_EPOCH};

use promfire_signal::Watcher;
use serde::Deserialize;
use tracing::debug;

use crate::{
    api::{self, Api},
    labels::LabelSet,
};

/// Path of the range query endpoint.
pub const QUERY_RANGE_PATH: &str = "/api/v1/query_range";

/// Errors produced by [`query_range`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backend could not answer the range query.
    #[error("Range query for {metric} failed: {source}")]
    Api {
        /// The queried metric
        metric: String,
        /// Underlying API error
        #[source]
        source: api::Error,
    },
}

impl Error {
    /// Whether the query was abandoned because the run was cancelled.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        match self {
            Error::Api { source, .. } => source.is_shutdown(),
        }
    }
}

/// The time range and resolution of a range query, in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Inclusive start
    pub start: i64,
    /// Inclusive end
    pub end: i64,
    /// Resolution in seconds
    pub step: u32,
}

impl Window {
    /// The window of `hours` hours ending at `end`.
    #[must_use]
    pub fn ending_at(end: SystemTime, hours: u32, step: u32) -> Self {
        let end = unix_seconds(end);
        Self {
            start: end.saturating_sub(i64::from(hours) * 3_600),
            end,
            step,
        }
    }

    /// The window of `hours` hours ending now.
    #[must_use]
    pub fn ending_now(hours: u32, step: u32) -> Self {
        Self::ending_at(SystemTime::now(), hours, step)
    }
}

#[allow(clippy::cast_possible_wrap)]
fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

/// A raw `[timestamp, value]` pair as returned by the backend. Neither element
/// is trusted to be well formed.
pub type RawSample = Vec<serde_json::Value>;

/// One series returned by a range query.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SeriesResult {
    /// The series' labels, `__name__` included when the backend reports it
    #[serde(default)]
    pub metric: LabelSet,
    /// Raw samples in backend order
    #[serde(default)]
    pub values: Vec<RawSample>,
}

// `resultType` is always `matrix` for a range query and is not inspected.
#[derive(Debug, Default, Deserialize)]
struct Data {
    #[serde(default)]
    result: Vec<SeriesResult>,
}

/// Fetch every series of `metric` over `window`.
///
/// # Errors
///
/// Returns an error if the backend is unreachable, answers with a non-2xx
/// status, a body that is not the expected JSON or an unsuccessful envelope,
/// or if `shutdown` fires first.
pub async fn query_range(
    api: &Api,
    metric: &str,
    window: &Window,
    shutdown: &mut Watcher,
) -> Result<Vec<SeriesResult>, Error> {
    let params = [
        ("query", metric.to_string()),
        ("start", window.start.to_string()),
        ("end", window.end.to_string()),
        ("step", window.step.to_string()),
    ];
    let data: Data = api
        .get(QUERY_RANGE_PATH, &params, shutdown)
        .await
        .map_err(|source| Error::Api {
            metric: metric.to_string(),
            source,
        })?;
    debug!(
        metric_name = metric,
        series = data.result.len(),
        "Range query complete"
    );
    Ok(data.result)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::{Duration, UNIX_EPOCH},
    };

    use http::Uri;
    use warp::Filter;

    use super::*;

    #[test]
    fn window_spans_the_configured_hours() {
        let end = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let window = Window::ending_at(end, 24, 60);
        assert_eq!(window.end, 1_700_000_000);
        assert_eq!(window.start, 1_700_000_000 - 86_400);
        assert_eq!(window.step, 60);
    }

    #[tokio::test]
    async fn query_sends_parameters_and_decodes_series() {
        let seen: Arc<Mutex<HashMap<String, String>>> = Arc::default();
        let captured = Arc::clone(&seen);
        let route = warp::path!("api" / "v1" / "query_range")
            .and(warp::query::<HashMap<String, String>>())
            .map(move |params: HashMap<String, String>| {
                *captured.lock().unwrap() = params;
                warp::reply::json(&serde_json::json!({
                    "status": "success",
                    "data": {
                        "resultType": "matrix",
                        "result": [
                            {
                                "metric": {"__name__": "http_requests_total", "code": "200"},
                                "values": [[1_700_000_000, "1"], [1_700_000_060, "2.5"]],
                            },
                            {
                                "metric": {"__name__": "http_requests_total", "code": "500"},
                                "values": [[1_700_000_000, "NaN"]],
                            },
                        ],
                    },
                }))
            });
        let (addr, serve_fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server_handle = tokio::spawn(serve_fut);

        let uri: Uri = format!("http://{addr}").parse().unwrap();
        let api = Api::new(&uri).unwrap();
        let window = Window {
            start: 100,
            end: 200,
            step: 15,
        };
        let (mut watcher, _broadcaster) = promfire_signal::signal();
        let series = query_range(&api, "http_requests_total{code=~\"2..\"}", &window, &mut watcher)
            .await
            .unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].metric["code"], "200");
        assert_eq!(series[0].values.len(), 2);
        assert_eq!(series[0].values[1][1], serde_json::json!("2.5"));

        let params = seen.lock().unwrap().clone();
        assert_eq!(params["query"], "http_requests_total{code=~\"2..\"}");
        assert_eq!(params["start"], "100");
        assert_eq!(params["end"], "200");
        assert_eq!(params["step"], "15");
    }

    #[tokio::test]
    async fn empty_result_is_not_an_error() {
        let route = warp::any().map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "success",
                "data": {"resultType": "matrix", "result": []},
            }))
        });
        let (addr, serve_fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server_handle = tokio::spawn(serve_fut);

        let uri: Uri = format!("http://{addr}").parse().unwrap();
        let api = Api::new(&uri).unwrap();
        let (mut watcher, _broadcaster) = promfire_signal::signal();
        let series = query_range(&api, "up", &Window::ending_now(1, 60), &mut watcher)
            .await
            .unwrap();
        assert!(series.is_empty());
    }

    #[tokio::test]
    async fn failure_names_the_metric() {
        let route = warp::any().map(|| {
            warp::reply::with_status(
                r#"{"status":"error","error":"bad query"}"#,
                warp::http::StatusCode::BAD_REQUEST,
            )
        });
        let (addr, serve_fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server_handle = tokio::spawn(serve_fut);

        let uri: Uri = format!("http://{addr}").parse().unwrap();
        let api = Api::new(&uri).unwrap();
        let (mut watcher, _broadcaster) = promfire_signal::signal();
        let err = query_range(&api, "up", &Window::ending_now(1, 60), &mut watcher)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("up"));
        assert!(!err.is_shutdown());
    }
}
