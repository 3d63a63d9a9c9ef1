//! Metric discovery and exclusion
//!
//! The catalog is every metric name the backend knows about, as reported by
//! the label values endpoint for `__name__`. Operators trim it with a list of
//! regular expressions. Patterns are compiled once, a pattern that does not
//! compile is reported and skipped rather than failing the run.

use metrics::counter;
use promfire_signal::Watcher;
use regex::Regex;
use tracing::{info, warn};

use crate::api::{self, Api};

/// Path of the label values endpoint listing every metric name.
pub const METRIC_NAMES_PATH: &str = "/api/v1/label/__name__/values";

/// Errors produced by [`discover`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backend could not list its metric names.
    #[error("Failed to discover metrics: {0}")]
    Api(#[from] api::Error),
}

impl Error {
    /// Whether discovery was abandoned because the run was cancelled.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        match self {
            Error::Api(err) => err.is_shutdown(),
        }
    }
}

/// An exclude pattern that failed to compile.
#[derive(thiserror::Error, Debug)]
#[error("Invalid exclude pattern `{pattern}`: {source}")]
pub struct PatternError {
    /// The pattern as configured
    pub pattern: String,
    /// Why it failed to compile
    #[source]
    pub source: regex::Error,
}

/// List every metric name known to the backend.
///
/// # Errors
///
/// Returns an error if the backend is unreachable, answers with a non-2xx
/// status, a body that is not the expected JSON or an unsuccessful envelope,
/// or if `shutdown` fires first.
pub async fn discover(api: &Api, shutdown: &mut Watcher) -> Result<Vec<String>, Error> {
    let names: Vec<String> = api.get(METRIC_NAMES_PATH, &[], shutdown).await?;
    info!("Discovered {count} metrics", count = names.len());
    counter!("metrics_discovered").increment(names.len() as u64);
    Ok(names)
}

/// The compiled set of exclude patterns.
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    patterns: Vec<Regex>,
}

impl ExcludeFilter {
    /// Compile `patterns`, logging and collecting every pattern that fails.
    ///
    /// Patterns use unanchored search semantics: `go_` excludes
    /// `process_go_info` as well as `go_goroutines`.
    pub fn compile<S>(patterns: &[S]) -> (Self, Vec<PatternError>)
    where
        S: AsRef<str>,
    {
        let mut compiled = Vec::with_capacity(patterns.len());
        let mut failures = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            match Regex::new(pattern) {
                Ok(regex) => compiled.push(regex),
                Err(source) => {
                    warn!(pattern, error = %source, "Skipping invalid exclude pattern");
                    failures.push(PatternError {
                        pattern: pattern.to_string(),
                        source,
                    });
                }
            }
        }
        (Self { patterns: compiled }, failures)
    }

    /// Whether `name` matches any compiled pattern.
    #[must_use]
    pub fn is_excluded(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(name))
    }

    /// Retain the names not matched by any pattern, preserving order.
    #[must_use]
    pub fn filter(&self, names: Vec<String>) -> Vec<String> {
        names
            .into_iter()
            .filter(|name| !self.is_excluded(name))
            .collect()
    }
}

/// Compile `patterns` and apply them to `names` in one step.
///
/// Invalid patterns are skipped with a warning.
#[must_use]
pub fn filter<S>(names: Vec<String>, patterns: &[S]) -> Vec<String>
where
    S: AsRef<str>,
{
    let (filter, _) = ExcludeFilter::compile(patterns);
    filter.filter(names)
}
