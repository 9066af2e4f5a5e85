use std::path::PathBuf;

pub type TlsResult<T> = Result<T, TlsError>;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("corrupt key material in {}: {reason}", path.display())]
    CorruptKeyMaterial { path: PathBuf, reason: String },

    #[error("key encoding: {0}")]
    KeyEncoding(String),

    #[error("certificate generation: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),

    /// Deliberately carries no detail about which check failed.
    #[error("TLS handshake failed")]
    Handshake,

    #[error("connect: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
