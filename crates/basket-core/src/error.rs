use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: bad embedding dimension, non-finite values,
    /// out-of-range top-k, malformed scope id. Never swallowed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Index not initialized, connection refused, retries exhausted.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
