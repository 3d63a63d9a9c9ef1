use std::{
    env,
    net::{AddrParseError, SocketAddr},
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use promfire::{
    config::{self, Config},
    replicator::{self, Replicator, Summary},
};
use tokio::{runtime::Builder, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Replication failed: {0}")]
    Replicator(#[from] replicator::Error),
    #[error("Parsing Prometheus address failed: {0}")]
    PrometheusAddr(#[from] AddrParseError),
    #[error("Failed to install Prometheus exporter: {0}")]
    Exporter(#[from] BuildError),
}

fn default_config_path() -> PathBuf {
    PathBuf::from("config.yaml")
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replicate the backend's series according to the configuration
    Run(RunArgs),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_os_t = default_config_path())]
    config_path: PathBuf,
    /// query and log what would be written without writing anything
    #[clap(long)]
    dry_run: bool,
    /// log level, overrides the configuration file, overridden by RUST_LOG
    #[clap(long)]
    log_level: Option<String>,
    /// address to bind a Prometheus exporter for promfire's own metrics to
    #[clap(long)]
    prometheus_addr: Option<String>,
}

#[derive(Args, Debug)]
struct ConfigCheckArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_os_t = default_config_path())]
    config_path: PathBuf,
}

/// `RUST_LOG` wins, then the command line, then the configuration file.
fn env_filter(
    rust_log: Option<&str>,
    cli_level: Option<&str>,
    config_level: Option<&str>,
) -> EnvFilter {
    let directives = rust_log
        .or(cli_level)
        .or(config_level)
        .unwrap_or(DEFAULT_LOG_LEVEL);
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

fn init_logging(cli_level: Option<&str>, config_level: Option<&str>) {
    let rust_log = env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(rust_log.as_deref(), cli_level, config_level))
        .with_ansi(false)
        .finish()
        .init();
}

fn validate_config(config_path: &Path) -> Result<Config, Error> {
    match config::load(config_path) {
        Ok(config) => {
            info!("Configuration file is valid");
            Ok(config)
        }
        Err(err) => {
            error!("Configuration validation failed: {err}");
            Err(err.into())
        }
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Unable to listen for SIGINT: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

async fn inner_main(
    config: Config,
    dry_run: bool,
    prometheus_addr: Option<SocketAddr>,
) -> Result<Summary, Error> {
    if let Some(addr) = prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Serving internal metrics on {addr}");
    }

    let (shutdown_watcher, shutdown_broadcast) = promfire_signal::signal();
    let replicator = Replicator::new(&config, dry_run, shutdown_watcher)?;

    let run = replicator.run();
    tokio::pin!(run);
    let res = tokio::select! {
        res = &mut run => res,
        () = shutdown_signal() => {
            info!("Cancelling run");
            shutdown_broadcast.signal();
            // In-flight work observes the signal and unwinds promptly.
            run.await
        }
    };
    Ok(res?)
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let args = match cli.command {
        Commands::Run(args) => args,
        Commands::ConfigCheck(args) => {
            init_logging(None, None);
            match validate_config(&args.config_path) {
                Ok(_) => std::process::exit(0),
                Err(_) => std::process::exit(1),
            }
        }
    };

    let config = config::load(&args.config_path);
    init_logging(
        args.log_level.as_deref(),
        config.as_ref().ok().and_then(|c| c.log_level.as_deref()),
    );
    let config = config.inspect_err(|err| error!("{err}"))?;

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting promfire {version} run.");

    let prometheus_addr = args
        .prometheus_addr
        .as_deref()
        .map(str::parse::<SocketAddr>)
        .transpose()?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, args.dry_run, prometheus_addr));
    match &res {
        Ok(_) => info!("Bye. :)"),
        Err(err) => error!("{err}"),
    }
    res.map(|_| ())
}
