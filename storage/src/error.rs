use thiserror::Error;

/// Error type for storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("authentication failure: {0}")]
    AuthFailure(String),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Fatal(String),
}

impl StorageError {
    /// Transient errors are absorbed by the retry layer; everything else unwinds.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}
