//! ndt-legacy - NDT legacy control-channel server

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ndt_legacy::config::Config;
use ndt_legacy::protocol::{DEFAULT_HTTP_PORT, DEFAULT_LEGACY_PORT};
use ndt_legacy::serve::{DEFAULT_TEST_DURATION, ListenConfig, Server, ServerConfig};

/// Initialize logging with optional file output
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("ndt_legacy={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer().with_target(false);

    if let Some(file_path) = log_file {
        let expanded_path = match file_path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(file_path)),
            None => PathBuf::from(file_path),
        };

        if let Some(parent) = expanded_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file_appender = tracing_appender::rolling::daily(
            expanded_path
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
            expanded_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("ndt-legacy.log")),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Keep guard alive for the duration of the program
        std::mem::forget(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "ndt-legacy")]
#[command(author, version, about = "NDT legacy protocol server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve legacy raw clients and WebSocket clients
    Serve {
        /// Legacy port address, raw and sniffed WebSocket clients (e.g. ":3001")
        #[arg(long, env = "NDT_LEGACY_ADDR")]
        legacy_addr: Option<String>,

        /// WebSocket server address; sniffed HTTP connections are forwarded here
        #[arg(long, env = "NDT_HTTP_ADDR")]
        http_addr: Option<String>,

        /// WSS server address (requires --cert and --key)
        #[arg(long, env = "NDT_TLS_ADDR")]
        tls_addr: Option<String>,

        /// TLS certificate (PEM)
        #[arg(long, env = "NDT_CERT")]
        cert: Option<PathBuf>,

        /// TLS private key (PEM)
        #[arg(long, env = "NDT_KEY")]
        key: Option<PathBuf>,

        /// Duration of each sub-test (e.g. "10s")
        #[arg(long, value_parser = parse_duration, env = "NDT_TEST_DURATION")]
        test_duration: Option<Duration>,

        /// Prometheus metrics port
        #[cfg(feature = "prometheus")]
        #[arg(long)]
        prometheus: Option<u16>,

        /// Log file path (e.g., "~/.config/ndt-legacy/ndt.log")
        #[arg(long, env = "NDT_LOG_FILE")]
        log_file: Option<String>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long, env = "NDT_LOG_LEVEL")]
        log_level: Option<String>,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config file (falls back to defaults if not found)
    let file_config = Config::load().unwrap_or_default();
    let defaults = file_config.server;

    match cli.command {
        Commands::Serve {
            legacy_addr,
            http_addr,
            tls_addr,
            cert,
            key,
            test_duration,
            #[cfg(feature = "prometheus")]
            prometheus,
            log_file,
            log_level,
        } => {
            let log_file = log_file.or(defaults.log_file);
            let log_level = log_level.or(defaults.log_level);
            init_logging(log_file.as_deref(), log_level.as_deref())?;

            let file_duration = match defaults.test_duration.as_deref() {
                Some(s) => Some(parse_duration(s).map_err(|e| {
                    anyhow::anyhow!("invalid test_duration {:?} in config file: {}", s, e)
                })?),
                None => None,
            };

            let listen = ListenConfig {
                legacy_addr: legacy_addr
                    .or(defaults.legacy_addr)
                    .unwrap_or_else(|| format!(":{}", DEFAULT_LEGACY_PORT)),
                http_addr: http_addr
                    .or(defaults.http_addr)
                    .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_HTTP_PORT)),
                tls_addr: tls_addr.or(defaults.tls_addr),
                #[cfg(feature = "prometheus")]
                prometheus_port: prometheus.or(defaults.prometheus_port),
            };
            let config = ServerConfig {
                cert_path: cert.or_else(|| defaults.cert.map(PathBuf::from)),
                key_path: key.or_else(|| defaults.key.map(PathBuf::from)),
                test_duration: test_duration
                    .or(file_duration)
                    .unwrap_or(DEFAULT_TEST_DURATION),
                ..Default::default()
            };

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Received ctrl-c"),
                    Err(e) => warn!("Could not listen for ctrl-c: {}", e),
                }
                let _ = shutdown_tx.send(true);
            });

            Server::new(listen, config).run(shutdown_rx).await?;
        }
    }

    Ok(())
}
