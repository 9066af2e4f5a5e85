//! bbd: BarterBackup daemon
//!
//! Usage:
//!   bbd [--config ~/.barterbackup/bb.toml] [--data-dir DIR] [--cli-addr 127.0.0.1:9911]
//!
//! Starts locked. `bbcli unlock` supplies the main password, after which the
//! node is published as a Tor onion service.

mod daemon;
mod grpc;
mod lock;
mod unlock;

use anyhow::Result;
use bb_core::config::{expand_tilde, BbConfig};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "bbd", version, about = "BarterBackup daemon")]
struct Cli {
    /// Path to bb.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "BBD_CONFIG",
        default_value = "~/.barterbackup/bb.toml"
    )]
    config: PathBuf,

    /// Base directory for daemon data (keys, fingerprint, tor)
    #[arg(long, env = "BBD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Local control-plane bind address (127.0.0.1:PORT)
    #[arg(long, env = "BBD_CLI_ADDR")]
    cli_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides daemon.log_level
    #[arg(long, env = "BBD_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides daemon.log_format
    #[arg(long, env = "BBD_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_tilde(&cli.config);
    let mut config = BbConfig::load(&config_path)?;

    let level = cli.log.unwrap_or_else(|| config.daemon.log_level.clone());
    let format = match cli.log_format {
        Some(format) => format,
        None => LogFormat::from_str(&config.daemon.log_format, true)
            .map_err(|e| anyhow::anyhow!("daemon.log_format: {e}"))?,
    };
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "bbd starting"
    );
    if !config_path.exists() {
        warn!("config file not found, using defaults");
    }

    if let Some(dir) = cli.data_dir {
        config.daemon.data_dir = dir;
    }
    if let Some(addr) = cli.cli_addr {
        config.daemon.cli_addr = addr;
    }

    daemon::run(config, shutdown_signal()).await
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested, stopping...");
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
