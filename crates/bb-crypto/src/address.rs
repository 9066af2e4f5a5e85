//! Tor v3 onion addresses
//!
//! ```text
//! address  = base32(pubkey || checksum || version) + ".onion"
//! checksum = SHA3-256(".onion checksum" || pubkey || version)[..2]
//! version  = 0x03
//! ```

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{VerifyingKey, PUBLIC_KEY_LENGTH};
use sha3::{Digest, Sha3_256};

use crate::{CryptoError, CryptoResult};

/// Virtual port assumed when a peer address carries no `:port` suffix.
pub const DEFAULT_ONION_PORT: u16 = 80;

const ONION_SUFFIX: &str = ".onion";
const ONION_VERSION: u8 = 0x03;
const ENCODED_LEN: usize = 56;
const DECODED_LEN: usize = PUBLIC_KEY_LENGTH + 2 + 1;

fn checksum(pubkey: &[u8]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

/// The overlay hostname of a node, e.g. `abcd…xyz.onion`.
///
/// Always lowercase, never carries a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let pubkey = key.as_bytes();
        let mut raw = [0u8; DECODED_LEN];
        raw[..PUBLIC_KEY_LENGTH].copy_from_slice(pubkey);
        raw[PUBLIC_KEY_LENGTH..PUBLIC_KEY_LENGTH + 2].copy_from_slice(&checksum(pubkey));
        raw[DECODED_LEN - 1] = ONION_VERSION;

        let encoded = BASE32_NOPAD.encode(&raw).to_ascii_lowercase();
        Self(format!("{encoded}{ONION_SUFFIX}"))
    }

    /// Parse a hostname, validating length, version and checksum.
    ///
    /// A trailing `:port` is accepted and dropped.
    pub fn parse(addr: &str) -> CryptoResult<Self> {
        let (host, _) = split_host_port(addr)?;
        let invalid = |reason| CryptoError::InvalidAddress {
            addr: addr.to_string(),
            reason,
        };

        let host = host.to_ascii_lowercase();
        let label = host
            .strip_suffix(ONION_SUFFIX)
            .ok_or_else(|| invalid("missing .onion suffix"))?;
        if label.len() != ENCODED_LEN {
            return Err(invalid("expected 56 base32 characters"));
        }

        let raw = BASE32_NOPAD
            .decode(label.to_ascii_uppercase().as_bytes())
            .map_err(|_| invalid("not base32"))?;
        if raw.len() != DECODED_LEN {
            return Err(invalid("wrong decoded length"));
        }
        if raw[DECODED_LEN - 1] != ONION_VERSION {
            return Err(invalid("unsupported version"));
        }
        let pubkey = &raw[..PUBLIC_KEY_LENGTH];
        if raw[PUBLIC_KEY_LENGTH..PUBLIC_KEY_LENGTH + 2] != checksum(pubkey) {
            return Err(invalid("checksum mismatch"));
        }

        Ok(Self(host))
    }

    /// Recover the Ed25519 public key the address was computed from.
    pub fn public_key(&self) -> CryptoResult<VerifyingKey> {
        let invalid = |reason| CryptoError::InvalidAddress {
            addr: self.0.clone(),
            reason,
        };
        let label = self
            .0
            .strip_suffix(ONION_SUFFIX)
            .ok_or_else(|| invalid("missing .onion suffix"))?;
        let raw = BASE32_NOPAD
            .decode(label.to_ascii_uppercase().as_bytes())
            .map_err(|_| invalid("not base32"))?;

        let mut key = [0u8; PUBLIC_KEY_LENGTH];
        key.copy_from_slice(
            raw.get(..PUBLIC_KEY_LENGTH)
                .ok_or_else(|| invalid("wrong decoded length"))?,
        );
        VerifyingKey::from_bytes(&key).map_err(|_| invalid("not an Ed25519 public key"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `host:port` dial target on the given virtual port.
    pub fn with_port(&self, port: u16) -> String {
        format!("{}:{port}", self.0)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeAddress {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for NodeAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Split `host[:port]`, defaulting the port to [`DEFAULT_ONION_PORT`].
pub fn split_host_port(addr: &str) -> CryptoResult<(&str, u16)> {
    match addr.rsplit_once(':') {
        None => Ok((addr, DEFAULT_ONION_PORT)),
        Some((host, port)) => {
            let port = port.parse().map_err(|_| CryptoError::InvalidAddress {
                addr: addr.to_string(),
                reason: "invalid port",
            })?;
            Ok((host, port))
        }
    }
}
