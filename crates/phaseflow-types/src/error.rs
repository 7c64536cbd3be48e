use thiserror::Error;

/// Errors from storage operations (used by the store trait in phaseflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("snapshot serialization error: {0}")]
    Serialization(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        RepositoryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
