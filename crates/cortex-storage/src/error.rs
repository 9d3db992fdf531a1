use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient infrastructure failure; callers may retry with caps.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Unique-key or check-constraint violation; not retryable.
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// Schema or index missing/mismatched; fatal at startup.
    #[error("backend misconfigured: {0}")]
    Misconfigured(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StorageError::Conflict(err.to_string())
            }
            _ => StorageError::Unavailable(err.to_string()),
        }
    }
}

impl From<StorageError> for cortex_core::CortexError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => cortex_core::CortexError::BackendUnavailable(msg),
            StorageError::Conflict(msg) => {
                cortex_core::CortexError::BackendConflict { code: msg }
            }
            StorageError::Misconfigured(msg) => {
                cortex_core::CortexError::BackendMisconfigured(msg)
            }
            StorageError::Serialization(e) => cortex_core::CortexError::Serialization(e),
            StorageError::Io(e) => cortex_core::CortexError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
