use thiserror::Error;

pub type SdriveResult<T> = Result<T, SdriveError>;

#[derive(Debug, Error)]
pub enum SdriveError {
    #[error("config error: {0}")]
    Config(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
