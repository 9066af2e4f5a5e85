//! Unlock gate: turns the main password into a running node, once.
//!
//! The password is checked against the data directory's fingerprint; on
//! success the node is started in the background and attached when ready.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use bb_core::types::NodeState;
use bb_crypto::{
    derive_identity, derive_master_secret, verify_or_init, CryptoError, FingerprintCheck,
    NODE_IDENTITY_PURPOSE,
};
use bb_net::{NetResult, Node, NodeConfig, Transport};
use secrecy::{ExposeSecret, SecretString};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Builds the transport for a freshly unlocked node.
pub type TransportFactory = Box<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    #[error("password required")]
    EmptyPassword,

    #[error("invalid password for this data directory")]
    WrongPassword,

    #[error("already unlocked")]
    AlreadyUnlocked,

    #[error(transparent)]
    Crypto(CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for UnlockError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::FingerprintMismatch(_) => UnlockError::WrongPassword,
            CryptoError::Io(e) => UnlockError::Io(e),
            other => UnlockError::Crypto(other),
        }
    }
}

enum Attachment {
    Locked,
    Starting,
    Attached(Arc<Node>),
}

pub struct UnlockGate {
    data_dir: PathBuf,
    node_config: NodeConfig,
    transport: TransportFactory,
    state: Arc<Mutex<Attachment>>,
    /// Serializes unlock attempts across the password derivation.
    unlocking: tokio::sync::Mutex<()>,
    start_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl UnlockGate {
    pub fn new(data_dir: PathBuf, node_config: NodeConfig, transport: TransportFactory) -> Self {
        Self {
            data_dir,
            node_config,
            transport,
            state: Arc::new(Mutex::new(Attachment::Locked)),
            unlocking: tokio::sync::Mutex::new(()),
            start_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn node_state(&self) -> NodeState {
        match &*lock(&self.state) {
            Attachment::Locked => NodeState::Locked,
            Attachment::Starting => NodeState::Starting,
            Attachment::Attached(_) => NodeState::Ready,
        }
    }

    /// The attached node, once it is serving.
    pub fn node(&self) -> Option<Arc<Node>> {
        match &*lock(&self.state) {
            Attachment::Attached(node) => Some(node.clone()),
            _ => None,
        }
    }

    /// Check `password` against the data directory and start the node in
    /// the background. Returns as soon as the node start has been launched;
    /// a failed start is logged and leaves the gate locked.
    pub async fn unlock(&self, password: SecretString) -> Result<(), UnlockError> {
        if password.expose_secret().is_empty() {
            return Err(UnlockError::EmptyPassword);
        }

        let _unlocking = self.unlocking.lock().await;
        if !matches!(*lock(&self.state), Attachment::Locked) {
            return Err(UnlockError::AlreadyUnlocked);
        }

        let data_dir = self.data_dir.clone();
        let identity = tokio::task::spawn_blocking(move || {
            let master = derive_master_secret(&password)?;
            match verify_or_init(&data_dir, &master)? {
                FingerprintCheck::Created => info!("fingerprint created (fresh instance)"),
                FingerprintCheck::Verified => info!("fingerprint verified (existing instance)"),
            }
            derive_identity(master.as_bytes(), NODE_IDENTITY_PURPOSE)
        })
        .await
        .map_err(std::io::Error::other)?
        .inspect_err(|e| {
            if matches!(e, CryptoError::FingerprintMismatch(_)) {
                warn!("fingerprint mismatch; rejecting unlock");
            }
        })?;

        let node = Arc::new(Node::new(
            identity,
            (self.transport)(),
            self.node_config.clone(),
        ));
        *lock(&self.state) = Attachment::Starting;

        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            info!(address = %node.address(), "starting P2P node");
            let started = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("node start cancelled");
                    *lock(&state) = Attachment::Locked;
                    return;
                }
                started = node.start() => started,
            };
            match started {
                Ok(()) => {
                    info!(address = %node.address(), "node unlocked");
                    *lock(&state) = Attachment::Attached(node);
                }
                Err(e) => {
                    error!(error = %e, "node start failed");
                    *lock(&state) = Attachment::Locked;
                }
            }
        });
        *lock(&self.start_task) = Some(task);

        Ok(())
    }

    /// Cancel a pending start and stop the attached node, if any.
    pub async fn shutdown(&self) -> NetResult<()> {
        self.cancel.cancel();
        let task = lock(&self.start_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let attached = std::mem::replace(&mut *lock(&self.state), Attachment::Locked);
        if let Attachment::Attached(node) = attached {
            node.stop().await?;
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
