//! rustls configurations for both ends of a pinned handshake

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::{ClientConfig, ServerConfig};

use crate::cert::{issue_certificate, CertRole};
use crate::pin::{PeerPin, PinnedClientVerifier, PinnedServerVerifier};
use crate::TlsResult;

const ALPN_H2: &[u8] = b"h2";

/// aws-lc-rs restricted to the X25519MLKEM768 post-quantum hybrid group.
pub fn crypto_provider() -> CryptoProvider {
    CryptoProvider {
        kx_groups: vec![aws_lc_rs::kx_group::X25519MLKEM768],
        ..aws_lc_rs::default_provider()
    }
}

/// Accepting side: presents a fresh certificate for `local` and requires the
/// client to satisfy `pin`.
pub fn acceptor_config(pin: PeerPin, local: &SigningKey) -> TlsResult<Arc<ServerConfig>> {
    let provider = Arc::new(crypto_provider());
    let (cert, key) = issue_certificate(local, CertRole::Server)?;

    let mut config = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(Arc::new(PinnedClientVerifier::new(pin, provider)))
        .with_single_cert(vec![cert], key)?;
    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(config))
}

/// Initiating side: no chain validation, the server key must satisfy `pin`.
pub fn initiator_config(pin: PeerPin, local: &SigningKey) -> TlsResult<Arc<ClientConfig>> {
    let provider = Arc::new(crypto_provider());
    let (cert, key) = issue_certificate(local, CertRole::Client)?;

    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier::new(pin, provider)))
        .with_client_auth_cert(vec![cert], key)?;
    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(config))
}
