//! Self-issued X.509 certificates over an Ed25519 key
//!
//! Certificates only carry the key through the handshake. They live in
//! memory, are reissued at every start and are never validated as a chain.

use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_ED25519,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

use crate::{TlsError, TlsResult};

const COMMON_NAME: &str = "barterbackup";
const SUBJECT_ALT_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];
const BACKDATE: Duration = Duration::hours(1);
const VALIDITY: Duration = Duration::days(10 * 365);

/// Which side(s) of a handshake a certificate may authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertRole {
    Server,
    Client,
    Both,
}

impl CertRole {
    fn usages(self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            CertRole::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            CertRole::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
            CertRole::Both => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        }
    }
}

/// Issue a self-signed certificate for `key`, valid from an hour ago for ten years.
pub fn issue_certificate(
    key: &SigningKey,
    role: CertRole,
) -> TlsResult<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let pkcs8 = key
        .to_pkcs8_der()
        .map_err(|e| TlsError::KeyEncoding(e.to_string()))?;
    let pkcs8 = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &PKCS_ED25519)?;

    let mut params =
        CertificateParams::new(SUBJECT_ALT_NAMES.iter().map(|s| s.to_string()).collect::<Vec<_>>())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, COMMON_NAME);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now + VALIDITY;

    // 62-bit random serial, always positive.
    let serial: u64 = rand::thread_rng().gen::<u64>() >> 2;
    params.serial_number = Some(SerialNumber::from(serial.to_be_bytes().to_vec()));

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = role.usages();

    let cert = params.self_signed(&key_pair)?;
    Ok((cert.der().clone(), PrivateKeyDer::Pkcs8(pkcs8)))
}
