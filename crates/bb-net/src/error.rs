use bb_crypto::CryptoError;
use bb_tls::TlsError;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(&'static str),

    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("unknown address: {0}")]
    UnknownAddress(String),

    #[error("address already registered: {0}")]
    AddressInUse(String),

    #[error("node already started")]
    AlreadyStarted,

    #[error("dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("tor: {0}")]
    Tor(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Crypto(CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for NetError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidAddress { addr, reason } => NetError::InvalidAddress {
                addr,
                reason: reason.to_string(),
            },
            other => NetError::Crypto(other),
        }
    }
}
