//! Daemon lifecycle: data directory, lock, control-plane keys, gRPC server, cleanup

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bb_core::config::{expand_tilde, BbConfig};
use bb_net::{NodeConfig, TorSettings, TorTransport, Transport};
use bb_tls::keyfile::remove_pinned_material;
use bb_tls::{acceptor_config, generate_keypair, persist_pinned_material, PeerPin};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::grpc::BbDaemonImpl;
use crate::lock::DirLock;
use crate::unlock::UnlockGate;

pub async fn run(config: BbConfig, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
    info!("daemon starting");

    let data_dir = expand_tilde(&config.daemon.data_dir);
    create_private_dir(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let cli_dir = config.daemon.cli_keys_dir();
    create_private_dir(&cli_dir)
        .with_context(|| format!("creating cli keys dir {}", cli_dir.display()))?;
    info!(dir = %cli_dir.display(), "using CLI key dir");

    // Lock before touching the key files: they may belong to a running daemon.
    let lock = DirLock::acquire(&cli_dir)?;
    info!(path = %lock.path().display(), "acquired lock");

    let gate = Arc::new(UnlockGate::new(
        data_dir.clone(),
        NodeConfig::from_config(&config),
        tor_factory(&config, data_dir.join("tor")),
    ));

    let mut errors: Vec<String> = Vec::new();
    if let Err(e) = serve(&config, &cli_dir, gate.clone(), shutdown).await {
        errors.push(format!("{e:#}"));
    }

    // ── Cleanup: every step runs, errors are collected ──────────────────
    info!("shutting down");
    if let Err(e) = gate.shutdown().await {
        errors.push(format!("node stop: {e}"));
    }
    if let Err(e) = remove_pinned_material(&cli_dir) {
        errors.push(format!("remove key files: {e}"));
    }
    if let Err(errs) = lock.release() {
        errors.extend(errs.into_iter().map(|e| format!("release lock: {e}")));
    }
    if let Err(e) = std::fs::remove_dir_all(&cli_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            errors.push(format!("remove cli-keys dir: {e}"));
        }
    }

    if errors.is_empty() {
        info!("daemon stopped");
        return Ok(());
    }
    for e in &errors {
        error!("{e}");
    }
    anyhow::bail!(errors.join("; "))
}

/// Fresh per-session keys, then the pinned control-plane server.
async fn serve(
    config: &BbConfig,
    cli_dir: &Path,
    gate: Arc<UnlockGate>,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<()> {
    info!("generating ephemeral server and CLI keypairs");
    let server_key = generate_keypair();
    let client_key = generate_keypair();
    persist_pinned_material(cli_dir, &server_key.verifying_key(), &client_key)
        .context("writing control-plane keys")?;
    info!(dir = %cli_dir.display(), "wrote server public key and client private key");

    // Only the holder of client.key may talk to us.
    let tls = acceptor_config(PeerPin::Key(client_key.verifying_key()), &server_key)
        .context("control-plane TLS")?;
    drop(client_key);

    let addr = &config.daemon.cli_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("listen {addr}"))?;

    crate::grpc::serve(listener, tls, BbDaemonImpl::new(gate), shutdown).await
}

fn tor_factory(config: &BbConfig, tor_dir: PathBuf) -> crate::unlock::TransportFactory {
    let settings = TorSettings::from_config(&config.tor, tor_dir);
    Box::new(move || {
        info!(dir = %settings.data_dir.display(), "using Tor transport");
        Arc::new(TorTransport::new(settings.clone())) as Arc<dyn Transport>
    })
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}
