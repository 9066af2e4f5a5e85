//! bb-tls: mutual TLS authenticated by pinned Ed25519 keys
//!
//! There is no certificate authority. Each side presents a throwaway
//! self-signed certificate over its Ed25519 key and checks the counterpart's
//! key directly:
//!
//! ```text
//! control plane   bbd  ── pins client.key ──▶  bbcli ── pins server.pub ──▶ bbd
//! peer link       node ── accepts any Ed25519 ─▶ RPC handler sees PeerIdentity
//!                 node ── pins key decoded from the dialed onion address
//! ```
//!
//! Handshakes are TLS 1.3 only with the X25519MLKEM768 hybrid key exchange.

pub mod cert;
pub mod channel;
pub mod config;
pub mod error;
pub mod incoming;
pub mod io;
pub mod keyfile;
pub mod pin;

pub use cert::{issue_certificate, CertRole};
pub use channel::{connect_channel, DialFn};
pub use config::{acceptor_config, crypto_provider, initiator_config};
pub use error::{TlsError, TlsResult};
pub use incoming::{client_public_key, secure_incoming, PeerIdentity, PeerStream};
pub use io::{BoxedIo, PeerIo};
pub use keyfile::{generate_keypair, load_pinned_material, persist_pinned_material, PinnedMaterial};
pub use pin::PeerPin;
