//! bb-net: how BarterBackup nodes reach each other
//!
//! ```text
//! Node ──serve──▶ Transport (Tor onion service | in-memory registry)
//!   │                 │ raw streams
//!   │                 ▼
//!   │             pinned TLS acceptor ──▶ tonic BbPeer server
//!   │
//!   └──dial_peer──▶ ConnectionPool ──miss──▶ Transport::dial ──▶ pinned TLS ──▶ Channel
//! ```

pub mod error;
pub mod node;
pub mod peer_service;
pub mod pool;
pub mod transport;

pub use error::{NetError, NetResult};
pub use node::{peer_client, peer_server, Node, NodeConfig};
pub use pool::{ConnectionPool, Evictor};
pub use transport::memory::MemoryTransport;
pub use transport::tor::{TorSettings, TorTransport};
pub use transport::{Registration, Transport};
