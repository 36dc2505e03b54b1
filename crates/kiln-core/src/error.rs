use thiserror::Error;

pub type KilnResult<T> = Result<T, KilnError>;

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("cache error: {0}")]
    Cache(String),

    #[error("hash error: {0}")]
    Hash(String),

    #[error("exec error: {0}")]
    Exec(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
