//! Certificate verifiers that pin the counterpart's Ed25519 key

use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, Error, SignatureScheme};
use tracing::debug;
use x509_parser::oid_registry::OID_SIG_ED25519;
use x509_parser::prelude::*;

/// What a handshake endpoint requires of its counterpart's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPin {
    /// Exactly this key, byte for byte.
    Key(VerifyingKey),
    /// Any Ed25519 key; the caller inspects it after the handshake.
    AnyEd25519,
}

impl PeerPin {
    fn check(&self, presented: &VerifyingKey) -> bool {
        match self {
            PeerPin::Key(expected) => expected.as_bytes() == presented.as_bytes(),
            PeerPin::AnyEd25519 => true,
        }
    }
}

/// Extract the Ed25519 public key of a DER certificate.
///
/// Returns `None` for unparsable certificates and for any other key type.
pub fn ed25519_key_of(cert: &CertificateDer<'_>) -> Option<VerifyingKey> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let spki = parsed.public_key();
    if spki.algorithm.algorithm != OID_SIG_ED25519 {
        return None;
    }
    let raw: &[u8] = spki.subject_public_key.data.as_ref();
    let bytes: &[u8; 32] = raw.try_into().ok()?;
    VerifyingKey::from_bytes(bytes).ok()
}

fn rejected() -> Error {
    Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
}

fn verify_pinned(pin: &PeerPin, cert: &CertificateDer<'_>, side: &str) -> Result<(), Error> {
    let Some(key) = ed25519_key_of(cert) else {
        debug!(side, "counterpart certificate does not carry an Ed25519 key");
        return Err(rejected());
    };
    if !pin.check(&key) {
        debug!(side, "counterpart public key does not match the pinned key");
        return Err(rejected());
    }
    Ok(())
}

/// Client side: skips chain validation and pins the server key.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    pin: PeerPin,
    provider: Arc<CryptoProvider>,
}

impl PinnedServerVerifier {
    pub fn new(pin: PeerPin, provider: Arc<CryptoProvider>) -> Self {
        Self { pin, provider }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        verify_pinned(&self.pin, end_entity, "server")?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Err(Error::General("TLS 1.2 is not supported".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

/// Server side: demands a client certificate and pins (or just type-checks) its key.
#[derive(Debug)]
pub struct PinnedClientVerifier {
    pin: PeerPin,
    provider: Arc<CryptoProvider>,
}

impl PinnedClientVerifier {
    pub fn new(pin: PeerPin, provider: Arc<CryptoProvider>) -> Self {
        Self { pin, provider }
    }
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        verify_pinned(&self.pin, end_entity, "client")?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Err(Error::General("TLS 1.2 is not supported".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}
