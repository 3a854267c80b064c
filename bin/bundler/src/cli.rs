use std::net::{IpAddr, SocketAddr};

use bundler_lib::Config;
use clap::{ArgAction, Parser, ValueEnum};
use eyre::WrapErr;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point for the bundler service.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// Service configuration.
    #[command(flatten)]
    pub config: Config,
    /// Logging configuration.
    #[command(flatten)]
    pub log: LogArgs,
    /// Metrics configuration.
    #[command(flatten)]
    pub metrics: MetricsArgs,
}

/// Stdout log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    /// Human readable, multi-field lines.
    #[default]
    Full,
    /// Condensed single lines.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Log-related CLI arguments.
///
/// Verbosity levels: 1=ERROR, 2=WARN, 3=INFO (default), 4=DEBUG, 5=TRACE.
#[derive(Debug, Clone, clap::Args)]
pub(crate) struct LogArgs {
    /// Increase logging verbosity (1=ERROR, 2=WARN, 3=INFO, 4=DEBUG, 5=TRACE).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, default_value = "3", env = "BUNDLER_LOG_LEVEL")]
    pub level: u8,

    /// Stdout log format.
    #[arg(long = "log.format", default_value = "full", env = "BUNDLER_LOG_FORMAT")]
    pub format: LogFormat,
}

impl LogArgs {
    fn level_filter(&self) -> LevelFilter {
        match self.level {
            0 => LevelFilter::OFF,
            1 => LevelFilter::ERROR,
            2 => LevelFilter::WARN,
            3 => LevelFilter::INFO,
            4 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Installs the global subscriber. `RUST_LOG` directives override the verbosity.
    pub fn init_tracing_subscriber(&self) -> eyre::Result<()> {
        let filter =
            EnvFilter::builder().with_default_directive(self.level_filter().into()).from_env_lossy();

        let stdout = match self.format {
            LogFormat::Full => fmt::layer().boxed(),
            LogFormat::Compact => fmt::layer().compact().boxed(),
            LogFormat::Json => fmt::layer().json().boxed(),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout)
            .try_init()
            .wrap_err("failed to install tracing subscriber")
    }
}

/// Prometheus exporter arguments.
#[derive(Debug, Clone, clap::Args)]
pub(crate) struct MetricsArgs {
    /// Serve Prometheus metrics.
    #[arg(long = "metrics.enabled", env = "BUNDLER_METRICS_ENABLED")]
    pub enabled: bool,

    /// Address of the metrics listener.
    #[arg(long = "metrics.addr", env = "BUNDLER_METRICS_ADDR", default_value = "0.0.0.0")]
    pub addr: IpAddr,

    /// Port of the metrics listener.
    #[arg(long = "metrics.port", env = "BUNDLER_METRICS_PORT", default_value = "9090")]
    pub port: u16,
}

impl MetricsArgs {
    /// Installs the Prometheus recorder and its HTTP listener when enabled.
    pub fn init(&self) -> eyre::Result<Option<SocketAddr>> {
        if !self.enabled {
            return Ok(None);
        }
        let addr = SocketAddr::from((self.addr, self.port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .wrap_err("failed to install Prometheus exporter")?;
        Ok(Some(addr))
    }
}
