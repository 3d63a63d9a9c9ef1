//! Configuration for a promfire run
//!
//! The configuration is a YAML document, read from a file or from the
//! `PROMFIRE_CONFIG` environment variable. Every field has a default. Zero
//! values and unknown fields are rejected at parse time so a typo never
//! silently falls back to a default.
use std::{
    env, fs, io,
    num::{NonZeroU16, NonZeroU32},
    path::{Path, PathBuf},
};

use http::Uri;
use serde::Deserialize;
use tracing::debug;

use crate::labels::ReplicationLabel;

/// Environment variable which, when set, holds the configuration contents and
/// takes precedence over any configuration file.
pub const CONFIG_ENV_VAR: &str = "PROMFIRE_CONFIG";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// A configured URL is not usable as an HTTP endpoint
    #[error("`{field}` must be an absolute http or https URL, got `{uri}`")]
    InvalidUrl {
        /// Name of the offending field
        field: &'static str,
        /// The configured value
        uri: Uri,
    },
}

const fn non_zero(value: u32) -> NonZeroU32 {
    match NonZeroU32::new(value) {
        Some(value) => value,
        None => panic!("default must not be zero"),
    }
}

const DEFAULT_REPLICATION_FACTOR: NonZeroU32 = non_zero(2);
const DEFAULT_QUERY_RANGE_HOURS: NonZeroU32 = non_zero(24);
const DEFAULT_QUERY_STEP_SECONDS: NonZeroU32 = non_zero(60);
const DEFAULT_SAMPLES_PER_SECOND: NonZeroU32 = non_zero(1_000);
const DEFAULT_BATCH_SIZE: NonZeroU32 = non_zero(100);

fn default_query_url() -> Uri {
    Uri::from_static("http://localhost:9090")
}

fn default_remote_write_url() -> Uri {
    Uri::from_static("http://localhost:9090/api/v1/write")
}

fn default_replication_factor() -> NonZeroU32 {
    DEFAULT_REPLICATION_FACTOR
}

fn default_query_range_hours() -> NonZeroU32 {
    DEFAULT_QUERY_RANGE_HOURS
}

fn default_query_step_seconds() -> NonZeroU32 {
    DEFAULT_QUERY_STEP_SECONDS
}

fn default_samples_per_second() -> NonZeroU32 {
    DEFAULT_SAMPLES_PER_SECOND
}

fn default_batch_size() -> NonZeroU32 {
    DEFAULT_BATCH_SIZE
}

fn default_parallel_metrics() -> NonZeroU16 {
    NonZeroU16::MIN
}

/// Main configuration struct for this program
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where to read series from and where to write replicas to
    #[serde(default)]
    pub prometheus: Prometheus,
    /// Shape and pace of the load
    #[serde(default)]
    pub benchmark: Benchmark,
    /// Labels used to distinguish replicas of a series
    #[serde(default)]
    pub replication_labels: Vec<ReplicationLabel>,
    /// Regular expressions, a metric matching any of them is not replicated
    #[serde(default)]
    pub exclude_metrics: Vec<String>,
    /// Log level used when neither the command line nor `RUST_LOG` set one
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Endpoints of the backend under test
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Prometheus {
    /// Root of the Prometheus query API
    #[serde(with = "http_serde::uri", default = "default_query_url")]
    pub query_url: Uri,
    /// Remote-write receiver
    #[serde(with = "http_serde::uri", default = "default_remote_write_url")]
    pub remote_write_url: Uri,
}

impl Default for Prometheus {
    fn default() -> Self {
        Self {
            query_url: default_query_url(),
            remote_write_url: default_remote_write_url(),
        }
    }
}

/// Benchmark parameters
#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Benchmark {
    /// Maximum number of replicas produced for every original series
    #[serde(default = "default_replication_factor")]
    pub replication_factor: NonZeroU32,
    /// How far back, in hours, series are queried
    #[serde(default = "default_query_range_hours")]
    pub query_range_hours: NonZeroU32,
    /// Resolution of the range query, in seconds
    #[serde(default = "default_query_step_seconds")]
    pub query_step_seconds: NonZeroU32,
    /// Steady-state rate of samples written
    #[serde(default = "default_samples_per_second")]
    pub samples_per_second: NonZeroU32,
    /// Maximum number of series per remote-write request
    #[serde(default = "default_batch_size")]
    pub batch_size: NonZeroU32,
    /// Number of metrics processed concurrently
    #[serde(default = "default_parallel_metrics")]
    pub parallel_metrics: NonZeroU16,
}

impl Default for Benchmark {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            query_range_hours: default_query_range_hours(),
            query_step_seconds: default_query_step_seconds(),
            samples_per_second: default_samples_per_second(),
            batch_size: default_batch_size(),
            parallel_metrics: default_parallel_metrics(),
        }
    }
}

impl Config {
    /// Check semantic constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if either endpoint lacks an `http` or
    /// `https` scheme or a host.
    pub fn validate(&self) -> Result<(), Error> {
        for (field, uri) in [
            ("prometheus.query_url", &self.prometheus.query_url),
            ("prometheus.remote_write_url", &self.prometheus.remote_write_url),
        ] {
            let scheme_ok = matches!(uri.scheme_str(), Some("http" | "https"));
            if !scheme_ok || uri.host().is_none() {
                return Err(Error::InvalidUrl {
                    field,
                    uri: uri.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Deserialize and validate `contents`.
///
/// # Errors
///
/// Returns an error if `contents` is not valid YAML for [`Config`] -- unknown
/// fields and zero-valued benchmark parameters included -- or if validation
/// fails.
pub fn parse(contents: &str) -> Result<Config, Error> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from [`CONFIG_ENV_VAR`] if set, else from `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or [`parse`] fails.
pub fn load(path: &Path) -> Result<Config, Error> {
    let contents = if let Ok(contents) = env::var(CONFIG_ENV_VAR) {
        debug!("Using config from env var '{CONFIG_ENV_VAR}'");
        contents
    } else {
        debug!("Attempting to open configuration file at: {}", path.display());
        fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?
    };
    parse(&contents)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, num::NonZeroU32};

    use http::Uri;

    use super::*;

    #[test]
    fn empty_document_takes_defaults() {
        let config = parse("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.benchmark.replication_factor.get(), 2);
        assert_eq!(config.benchmark.query_range_hours.get(), 24);
        assert_eq!(config.benchmark.query_step_seconds.get(), 60);
        assert_eq!(config.benchmark.samples_per_second.get(), 1_000);
        assert_eq!(config.benchmark.batch_size.get(), 100);
        assert_eq!(config.benchmark.parallel_metrics.get(), 1);
        assert_eq!(
            config.prometheus.remote_write_url,
            Uri::from_static("http://localhost:9090/api/v1/write")
        );
    }

    #[test]
    fn full_document() {
        let contents = r#"
prometheus:
  query_url: http://prom.example:9090
  remote_write_url: https://ingest.example/api/v1/write
benchmark:
  replication_factor: 8
  query_range_hours: 1
  query_step_seconds: 15
  samples_per_second: 50
  batch_size: 10
replication_labels:
  - name: region
    values: [us, eu]
  - name: benchmark_instance
exclude_metrics:
  - "^go_"
  - "^process_"
log_level: debug
"#;
        let config = parse(contents).unwrap();
        assert_eq!(config.benchmark.replication_factor, NonZeroU32::new(8).unwrap());
        assert_eq!(config.benchmark.batch_size, NonZeroU32::new(10).unwrap());
        assert_eq!(config.replication_labels.len(), 2);
        assert_eq!(config.replication_labels[0].values, vec!["us", "eu"]);
        assert!(config.replication_labels[1].values.is_empty());
        assert_eq!(config.exclude_metrics, vec!["^go_", "^process_"]);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(
            config.prometheus.query_url,
            Uri::from_static("http://prom.example:9090")
        );
    }

    #[test]
    fn zero_values_are_rejected() {
        for field in [
            "replication_factor",
            "query_range_hours",
            "query_step_seconds",
            "samples_per_second",
            "batch_size",
            "parallel_metrics",
        ] {
            let contents = format!("benchmark:\n  {field}: 0\n");
            assert!(
                matches!(parse(&contents), Err(Error::SerdeYaml(_))),
                "{field} accepted zero"
            );
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(parse("benchmark:\n  replicaton_factor: 3\n").is_err());
        assert!(parse("surprise: true\n").is_err());
    }

    #[test]
    fn relative_urls_are_rejected() {
        let err = parse("prometheus:\n  query_url: /api\n").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidUrl {
                field: "prometheus.query_url",
                ..
            }
        ));

        let err = parse("prometheus:\n  remote_write_url: ftp://host/write\n").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidUrl {
                field: "prometheus.remote_write_url",
                ..
            }
        ));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "benchmark:\n  batch_size: 7").unwrap();
        let config = load(file.path()).unwrap();
        assert_eq!(config.benchmark.batch_size.get(), 7);
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        assert!(matches!(load(&path), Err(Error::ReadFile { .. })));
    }
}
