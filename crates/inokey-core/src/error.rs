use thiserror::Error;

pub type InokeyResult<T> = Result<T, InokeyError>;

#[derive(Debug, Error)]
pub enum InokeyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
