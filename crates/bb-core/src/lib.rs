pub mod config;
pub mod error;
pub mod types;

pub use error::{BbError, BbResult};

/// Generated gRPC types and service traits (from bb.proto)
pub mod proto {
    tonic::include_proto!("bb");
}

/// Maximum message size for peer-to-peer RPCs, applied to send and receive
/// on both server and client. The local control plane is not limited.
pub const PEER_MAX_MESSAGE_BYTES: usize = 16 * 1024;
