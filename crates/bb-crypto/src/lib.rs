//! bb-crypto: deterministic node identity for BarterBackup
//!
//! Everything a node is derives from the user's password:
//! ```text
//! password
//!   └── Master Secret (512-bit, Argon2id, salt derived from the password)
//!         ├── Fingerprint   (HKDF-SHA256, purpose="fingerprint", persisted hex)
//!         └── Node Identity (HKDF-SHA256, purpose="tor/onion/v3" → Ed25519 seed)
//!               └── Node Address (Tor v3 onion hostname of the public key)
//! ```
//!
//! Two processes given the same password derive the same identity and
//! address without any coordination.

pub mod address;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod kdf;

pub use address::{split_host_port, NodeAddress, DEFAULT_ONION_PORT};
pub use error::{CryptoError, CryptoResult};
pub use fingerprint::{verify_or_init, FingerprintCheck, FINGERPRINT_FILE};
pub use identity::{derive_identity, Identity, NODE_IDENTITY_PURPOSE};
pub use kdf::{derive_key, derive_master_secret, MasterSecret, MASTER_SECRET_SIZE};
