//! tonic control-plane server over pinned TLS on loopback

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bb_core::proto::{
    bb_daemon_server::{BbDaemon, BbDaemonServer},
    LocalHealthCheckRequest, LocalHealthCheckResponse, UnlockRequest, UnlockResponse,
};
use bb_tls::{secure_incoming, BoxedIo};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::unlock::{UnlockError, UnlockGate};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Implementation of the BbDaemon gRPC service
pub struct BbDaemonImpl {
    gate: Arc<UnlockGate>,
    start_time: Instant,
}

impl BbDaemonImpl {
    pub fn new(gate: Arc<UnlockGate>) -> Self {
        Self {
            gate,
            start_time: Instant::now(),
        }
    }
}

fn unlock_status(e: UnlockError) -> tonic::Status {
    match e {
        UnlockError::EmptyPassword => tonic::Status::invalid_argument(e.to_string()),
        UnlockError::AlreadyUnlocked => tonic::Status::failed_precondition(e.to_string()),
        UnlockError::WrongPassword => tonic::Status::permission_denied(e.to_string()),
        other => tonic::Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl BbDaemon for BbDaemonImpl {
    async fn local_health_check(
        &self,
        _request: tonic::Request<LocalHealthCheckRequest>,
    ) -> Result<tonic::Response<LocalHealthCheckResponse>, tonic::Status> {
        let server_onion = self
            .gate
            .node()
            .map(|node| node.address().to_string())
            .unwrap_or_default();
        Ok(tonic::Response::new(LocalHealthCheckResponse {
            server_onion,
            uptime_seconds: self.start_time.elapsed().as_secs() as i64,
            node_state: self.gate.node_state().to_string(),
        }))
    }

    async fn unlock(
        &self,
        request: tonic::Request<UnlockRequest>,
    ) -> Result<tonic::Response<UnlockResponse>, tonic::Status> {
        let password = SecretString::from(request.into_inner().main_password);
        self.gate.unlock(password).await.map_err(|e| {
            warn!(error = %e, "unlock rejected");
            unlock_status(e)
        })?;
        Ok(tonic::Response::new(UnlockResponse {}))
    }
}

/// Serve the control plane on `listener` until `shutdown` resolves. Only
/// clients completing the handshake configured in `tls` get through.
pub async fn serve(
    listener: TcpListener,
    tls: Arc<rustls::ServerConfig>,
    impl_: BbDaemonImpl,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<()> {
    let local: SocketAddr = listener.local_addr()?;
    let (raw_tx, raw_rx) = mpsc::channel::<BoxedIo>(16);

    let accept = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "control-plane connection");
                    if raw_tx.send(Box::new(stream)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "control-plane accept failed"),
            }
        }
    });

    info!(addr = %local, "gRPC server ready");

    let served = Server::builder()
        .add_service(BbDaemonServer::new(impl_))
        .serve_with_incoming_shutdown(secure_incoming(raw_rx, tls, HANDSHAKE_TIMEOUT), shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("gRPC server error: {e}"));

    accept.abort();
    served
}
