use thiserror::Error;

/// Top-level error type for Marginalia.
///
/// The first four variants are the caller-facing taxonomy: malformed input,
/// unresolved ids, lost join races and failures of the embedding provider.
/// `Storage` covers the durable backend and is treated like an upstream
/// failure by the API layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MarginaliaError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MarginaliaError {
    /// True for errors caused by the caller's input (4xx-equivalent).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MarginaliaError::Validation(_) | MarginaliaError::NotFound(_)
        )
    }
}

impl From<toml::de::Error> for MarginaliaError {
    fn from(err: toml::de::Error) -> Self {
        MarginaliaError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for MarginaliaError {
    fn from(err: toml::ser::Error) -> Self {
        MarginaliaError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MarginaliaError {
    fn from(err: serde_json::Error) -> Self {
        MarginaliaError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Marginalia operations.
pub type Result<T> = std::result::Result<T, MarginaliaError>;
