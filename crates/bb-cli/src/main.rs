//! bbcli: BarterBackup command-line interface
//!
//! Commands:
//!   healthcheck                      - daemon uptime, node state and onion address
//!   unlock [--password-file <path>]  - hand the main password to the daemon
//!
//! Talks to bbd over loopback TLS pinned with the per-session keys the daemon
//! writes into its cli-keys directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::FutureExt;
use secrecy::{ExposeSecret, SecretString};
use std::io::{BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Channel;

use bb_core::config::expand_tilde;
use bb_core::proto::{bb_daemon_client::BbDaemonClient, LocalHealthCheckRequest, UnlockRequest};
use bb_tls::{connect_channel, initiator_config, load_pinned_material, BoxedIo, DialFn, PeerPin};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "bbcli", version, about = "BarterBackup client")]
struct Cli {
    /// Local daemon address to connect to
    #[arg(long, env = "BBCLI_DAEMON_ADDR", default_value = "127.0.0.1:9911")]
    daemon_addr: String,

    /// Directory containing client.key and server.pub
    #[arg(long, env = "BBCLI_CLI_KEYS_DIR", default_value = "~/.barterbackup/cli-keys")]
    cli_keys_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BBCLI_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check local daemon health
    Healthcheck,

    /// Unlock the daemon with the main password (prompted, or read from a file)
    Unlock {
        /// File whose first line is the password
        #[arg(long)]
        password_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let keys_dir = expand_tilde(&cli.cli_keys_dir);
    match cli.command {
        Commands::Healthcheck => cmd_healthcheck(&cli.daemon_addr, &keys_dir).await,
        Commands::Unlock { password_file } => {
            // Ask before connecting so the prompt is not raced by a timeout.
            let password = read_password(password_file.as_deref())?;
            cmd_unlock(&cli.daemon_addr, &keys_dir, password).await
        }
    }
}

// ── `bbcli healthcheck` ───────────────────────────────────────────────────────

async fn cmd_healthcheck(daemon_addr: &str, keys_dir: &Path) -> Result<()> {
    let mut client = connect_daemon(daemon_addr, keys_dir).await?;

    let mut request = tonic::Request::new(LocalHealthCheckRequest {});
    request.set_timeout(HEALTHCHECK_TIMEOUT);
    let health = client
        .local_health_check(request)
        .await
        .context("LocalHealthCheck RPC failed")?
        .into_inner();

    let onion = if health.server_onion.is_empty() {
        "(locked)"
    } else {
        health.server_onion.as_str()
    };
    println!("Server onion: {onion}");
    println!("Node state:   {}", health.node_state);
    println!("Uptime:       {}", format_uptime(health.uptime_seconds));
    Ok(())
}

// ── `bbcli unlock` ────────────────────────────────────────────────────────────

async fn cmd_unlock(daemon_addr: &str, keys_dir: &Path, password: SecretString) -> Result<()> {
    let mut client = connect_daemon(daemon_addr, keys_dir).await?;

    client
        .unlock(UnlockRequest {
            main_password: password.expose_secret().to_string(),
        })
        .await
        .map_err(|status| anyhow::anyhow!("unlock failed: {}", status.message()))?;

    println!("Unlocked. The node is starting; check progress with `bbcli healthcheck`.");
    Ok(())
}

fn read_password(password_file: Option<&Path>) -> Result<SecretString> {
    if let Some(path) = password_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading password file {}", path.display()))?;
        return Ok(SecretString::from(first_line(&contents)));
    }

    if std::io::stdin().is_terminal() {
        let password = rpassword::prompt_password("Password: ").context("reading password")?;
        return Ok(SecretString::from(password));
    }

    // Piped input: read one line, echo is not an issue.
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading password from stdin")?;
    Ok(SecretString::from(first_line(&line)))
}

/// Everything up to the first line ending.
fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().to_string()
}

fn format_uptime(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

// ── gRPC connection ───────────────────────────────────────────────────────────

async fn connect_daemon(daemon_addr: &str, keys_dir: &Path) -> Result<BbDaemonClient<Channel>> {
    let material = load_pinned_material(keys_dir).with_context(|| {
        format!(
            "loading CLI keys from {} (is bbd running?)",
            keys_dir.display()
        )
    })?;
    let tls = initiator_config(PeerPin::Key(material.server_public), &material.client_private)
        .context("building TLS config")?;

    let addr = daemon_addr.to_string();
    let dial: DialFn = Arc::new(move || {
        let addr = addr.clone();
        async move {
            let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
            Ok::<_, std::io::Error>(Box::new(stream) as BoxedIo)
        }
        .boxed()
    });

    let channel = connect_channel(tls, dial, CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("connecting to bbd at {daemon_addr}"))?;

    Ok(BbDaemonClient::new(channel))
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
