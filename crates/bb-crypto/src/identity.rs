//! Ed25519 node identity derived from the master secret

use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::kdf::derive_key;
use crate::{CryptoError, CryptoResult, NodeAddress};

/// Purpose label of the node's long-term transport identity.
pub const NODE_IDENTITY_PURPOSE: &str = "tor/onion/v3";

/// A node's signing keypair.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn address(&self) -> NodeAddress {
        NodeAddress::from_public_key(&self.verifying_key())
    }

    /// Tor's 64-byte expanded secret key: `clamp(SHA-512(seed)[..32]) || SHA-512(seed)[32..]`.
    pub fn expanded_secret(&self) -> Zeroizing<[u8; 64]> {
        let digest = Sha512::digest(self.signing_key.as_bytes());
        let mut expanded = Zeroizing::new([0u8; 64]);
        expanded.copy_from_slice(&digest);
        expanded[0] &= 248;
        expanded[31] &= 63;
        expanded[31] |= 64;
        expanded
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self::from_signing_key(self.signing_key.clone())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address().as_str())
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// Derive an Ed25519 identity: the 32-byte seed is `derive_key(master, purpose, 32)`.
pub fn derive_identity(master: &[u8], purpose: &str) -> CryptoResult<Identity> {
    if master.is_empty() {
        return Err(CryptoError::EmptyInput);
    }
    let okm = derive_key(master, purpose, SECRET_KEY_LENGTH)?;
    let mut seed = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
    seed.copy_from_slice(&okm);
    Ok(Identity::from_signing_key(SigningKey::from_bytes(&seed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive_master_secret;
    use data_encoding::HEXLOWER;
    use secrecy::SecretString;

    #[test]
    fn test_empty_master_rejected() {
        let err = derive_identity(&[], NODE_IDENTITY_PURPOSE).unwrap_err();
        assert!(matches!(err, CryptoError::EmptyInput));
    }

    #[test]
    fn test_identity_known_answers() {
        let master = derive_master_secret(&SecretString::from("test-seed")).unwrap();
        let cases = [
            (
                NODE_IDENTITY_PURPOSE,
                "d3ce31dc0f3a710b4a3d42259a7628a894c4b6c2bd3a0ed6e6bb0a8e003b2348",
                "8031f51821da22e80497bc338ca38cb7ac2c6739b706dcff776d4e71a62e7124",
            ),
            (
                "ed25519/generic",
                "f1b56590d316b35d65d1088325395f52359bf3f65c68c683e7d82b7eb8dcb52d",
                "06ccbedc5b86851cd0ee8c648e4bfcc75347431a8c39d0dcb066a8497694d931",
            ),
        ];

        for (purpose, seed, public) in cases {
            let id = derive_identity(master.as_bytes(), purpose).unwrap();
            assert_eq!(HEXLOWER.encode(id.signing_key().as_bytes()), seed);
            assert_eq!(HEXLOWER.encode(id.verifying_key().as_bytes()), public);
        }
    }

    #[test]
    fn test_identity_deterministic() {
        let master = [3u8; 64];
        let a = derive_identity(&master, NODE_IDENTITY_PURPOSE).unwrap();
        let b = derive_identity(&master, NODE_IDENTITY_PURPOSE).unwrap();
        assert_eq!(a.verifying_key(), b.verifying_key());
        assert_eq!(a.address(), b.address());

        let other = derive_identity(&master, "ed25519/generic").unwrap();
        assert_ne!(a.verifying_key(), other.verifying_key());
    }

    #[test]
    fn test_expanded_secret_is_clamped() {
        let id = derive_identity(&[5u8; 64], NODE_IDENTITY_PURPOSE).unwrap();
        let expanded = id.expanded_secret();
        assert_eq!(expanded[0] & 7, 0);
        assert_eq!(expanded[31] & 128, 0);
        assert_eq!(expanded[31] & 64, 64);

        let digest = Sha512::digest(id.signing_key().as_bytes());
        assert_eq!(&expanded[32..], &digest[32..]);
    }

    #[test]
    fn test_debug_redacts_key() {
        let id = derive_identity(&[5u8; 64], NODE_IDENTITY_PURPOSE).unwrap();
        let dbg = format!("{id:?}");
        assert!(dbg.contains(".onion"));
        assert!(dbg.contains("REDACTED"));
    }
}
