//! The node's peer-facing RPC surface

use bb_core::proto::bb_peer_server::BbPeer;
use bb_core::proto::{HealthCheckRequest, HealthCheckResponse};
use bb_crypto::NodeAddress;
use bb_tls::client_public_key;
use tonic::{Request, Response, Status};
use tracing::debug;

pub struct PeerService {
    address: NodeAddress,
}

impl PeerService {
    pub fn new(address: NodeAddress) -> Self {
        Self { address }
    }
}

#[tonic::async_trait]
impl BbPeer for PeerService {
    /// Echo back who the caller is (by its certificate key) and who we are.
    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let client_key = client_public_key(&request)
            .ok_or_else(|| Status::unauthenticated("client certificate required"))?;
        let client_onion = NodeAddress::from_public_key(&client_key);
        debug!(client = %client_onion, "peer health check");

        Ok(Response::new(HealthCheckResponse {
            client_onion: client_onion.to_string(),
            server_onion: self.address.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[tokio::test]
    async fn test_health_check_requires_client_identity() {
        let server = SigningKey::from_bytes(&[1u8; 32]);
        let svc = PeerService::new(NodeAddress::from_public_key(&server.verifying_key()));

        let status = svc
            .health_check(Request::new(HealthCheckRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }
}
