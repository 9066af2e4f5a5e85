//! Key derivation: password → master secret (Argon2id), master secret → subkeys (HKDF-SHA256)

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::{CryptoError, CryptoResult};

/// Size of the master secret in bytes (512-bit)
pub const MASTER_SECRET_SIZE: usize = 64;

const ARGON2_MEM_COST_KIB: u32 = 64 * 1024;
const ARGON2_TIME_COST: u32 = 1;
const ARGON2_PARALLELISM: u32 = 4;

const MASTER_SALT_TAG: &[u8] = b"deriveMasterPriv";
const DERIVE_KEY_SALT: &[u8] = b"deriveKey";

/// The root secret every other key is derived from.
///
/// Held in memory only and zeroized on drop.
#[derive(Clone)]
pub struct MasterSecret {
    bytes: [u8; MASTER_SECRET_SIZE],
}

impl MasterSecret {
    pub fn from_bytes(bytes: [u8; MASTER_SECRET_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_SECRET_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Salt = SHA-256( SHA-256(password) || SHA-256("deriveMasterPriv") ).
///
/// Deterministic so that nothing but the password has to be remembered.
fn master_salt(password: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(Sha256::digest(password));
    hasher.update(Sha256::digest(MASTER_SALT_TAG));
    let mut salt = [0u8; 32];
    salt.copy_from_slice(&hasher.finalize());
    salt
}

/// Derive the master secret from a password using Argon2id
/// (t=1, m=64 MiB, p=4, 64-byte output).
///
/// Any string, including the empty one, is accepted. The only failure is a
/// password longer than Argon2 can absorb (4 GiB).
///
/// This is CPU and memory heavy; async callers should run it under
/// `tokio::task::spawn_blocking`.
pub fn derive_master_secret(password: &SecretString) -> CryptoResult<MasterSecret> {
    let pwd = password.expose_secret().as_bytes();
    let salt = master_salt(pwd);

    let params = Params::new(
        ARGON2_MEM_COST_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(MASTER_SECRET_SIZE),
    )
    .map_err(CryptoError::Kdf)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut bytes = [0u8; MASTER_SECRET_SIZE];
    argon2
        .hash_password_into(pwd, &salt, &mut bytes)
        .map_err(CryptoError::Kdf)?;

    let secret = MasterSecret::from_bytes(bytes);
    bytes.zeroize();
    Ok(secret)
}

/// Derive `len` bytes from `master` for the given purpose label via
/// HKDF-SHA256 (salt `"deriveKey"`, info = purpose).
///
/// Pure: the same inputs always give the same output, and distinct purposes
/// give independent keys.
pub fn derive_key(master: &[u8], purpose: &str, len: usize) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(Some(DERIVE_KEY_SALT), master);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hkdf.expand(purpose.as_bytes(), &mut okm)
        .map_err(|_| CryptoError::ShortOutput { requested: len })?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_encoding::HEXLOWER;
    use proptest::prelude::*;

    fn master(password: &str) -> MasterSecret {
        derive_master_secret(&SecretString::from(password)).unwrap()
    }

    #[test]
    fn test_master_secret_known_answers() {
        let cases = [
            (
                "",
                "ecc7360ce9c0f8e0cec5d8be2ddbcf9c4bb1a810c5350e4081db45eaf899f2ed0a7baed905d7b88eab4fa85d86e32103867e617166628e0db68a9684ca24a7ab",
            ),
            (
                "password",
                "b9a023e45bd280e4cc6d093feb81dc1f34423523f7ac6e730e337ab4b3d79ff0112b694de0cd1fad90ed55393222e5a47f656c20f488be5522afe98bd7f9de07",
            ),
            (
                "pässwörd",
                "4fd00b3a4ca5cf0d5e81f9b1caad16f9596158726ea0c942f13157699cd4c0a57ccfcd04850ca56c180769a180d1d8752047b9c1f60fe9d1c5f62e42297e851d",
            ),
        ];

        for (password, want) in cases {
            let got = master(password);
            assert_eq!(HEXLOWER.encode(got.as_bytes()), want, "password {password:?}");
        }
    }

    #[test]
    fn test_master_secret_deterministic() {
        let a = master("correct horse");
        let b = master("correct horse");
        assert_eq!(a.as_bytes(), b.as_bytes(), "Argon2id must be deterministic");

        let c = master("correct horse!");
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_derive_key_known_answers() {
        let m = master("test-seed");
        let cases = [
            ("purpose-32", 32, "e5f72051031a2bb3c75a9f50d8640fd3fdfbc7cd01fd9f9fee96d9e01e522225"),
            ("tor/onion/v3", 32, "d3ce31dc0f3a710b4a3d42259a7628a894c4b6c2bd3a0ed6e6bb0a8e003b2348"),
            (
                "purpose-48",
                48,
                "35278391bd7b851be5a795a3d46713350ac6488bfaeb67bcdcec37919c099461aaa6267470cc8d284173d182f5797fd2",
            ),
        ];

        for (purpose, len, want) in cases {
            let got = derive_key(m.as_bytes(), purpose, len).unwrap();
            assert_eq!(got.len(), len);
            assert_eq!(HEXLOWER.encode(&got), want, "purpose {purpose:?}");
        }
    }

    #[test]
    fn test_derive_key_too_long() {
        // HKDF-SHA256 is capped at 255 * 32 bytes.
        let err = derive_key(&[7u8; 64], "huge", 255 * 32 + 1).unwrap_err();
        assert!(matches!(err, CryptoError::ShortOutput { requested } if requested == 8161));

        assert!(derive_key(&[7u8; 64], "max", 255 * 32).is_ok());
    }

    #[test]
    fn test_master_secret_debug_redacted() {
        let m = MasterSecret::from_bytes([0xAB; MASTER_SECRET_SIZE]);
        let dbg = format!("{m:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("171"));
    }

    proptest! {
        #[test]
        fn derive_key_is_deterministic(
            master in proptest::collection::vec(any::<u8>(), 1..=64),
            purpose in "[a-z/0-9-]{0,24}",
            len in 1usize..=96,
        ) {
            let a = derive_key(&master, &purpose, len).unwrap();
            let b = derive_key(&master, &purpose, len).unwrap();
            prop_assert_eq!(a.as_slice(), b.as_slice());
        }

        #[test]
        fn derive_key_separates_purposes(
            master in proptest::collection::vec(any::<u8>(), 1..=64),
            p1 in "[a-z]{1,16}",
            p2 in "[a-z]{1,16}",
        ) {
            prop_assume!(p1 != p2);
            let a = derive_key(&master, &p1, 32).unwrap();
            let b = derive_key(&master, &p2, 32).unwrap();
            prop_assert_ne!(a.as_slice(), b.as_slice());
        }
    }
}
