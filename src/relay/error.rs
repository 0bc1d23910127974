use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
