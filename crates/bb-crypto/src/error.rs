use std::path::PathBuf;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key derivation could not produce {requested} bytes")]
    ShortOutput { requested: usize },

    #[error("empty master secret")]
    EmptyInput,

    #[error("Argon2id: {0}")]
    Kdf(argon2::Error),

    #[error("invalid onion address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: &'static str },

    #[error("password does not match the fingerprint stored in {}", .0.display())]
    FingerprintMismatch(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
