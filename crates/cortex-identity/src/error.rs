use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("user not found: {0}")]
    NotFound(String),

    #[error("user is inactive")]
    Inactive,

    #[error("identity provider error: {0}")]
    Provider(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<IdentityError> for cortex_core::CortexError {
    fn from(err: IdentityError) -> Self {
        match err {
            // Inactive users and bad tokens look identical to callers.
            IdentityError::AuthFailed(_) | IdentityError::Inactive => {
                cortex_core::CortexError::Unauthenticated("invalid credentials".into())
            }
            IdentityError::NotFound(id) => {
                cortex_core::CortexError::NotFound(format!("user {}", id))
            }
            IdentityError::Provider(msg) => {
                cortex_core::CortexError::Unauthenticated(format!("idp unreachable: {}", msg))
            }
            IdentityError::Database(e) => {
                cortex_core::CortexError::BackendUnavailable(e.to_string())
            }
            IdentityError::Serialization(e) => cortex_core::CortexError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;
