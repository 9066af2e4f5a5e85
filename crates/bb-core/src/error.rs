use thiserror::Error;

pub type BbResult<T> = Result<T, BbError>;

#[derive(Debug, Error)]
pub enum BbError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
