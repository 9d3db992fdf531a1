use thiserror::Error;

/// Error taxonomy shared by every component. Infrastructure errors are
/// translated into one of these kinds at the component boundary; only the
/// pipeline and the gateway turn them into user-visible frames or HTTP
/// statuses. Raw backend / IdP error text never crosses this boundary.
#[derive(Debug, Error)]
pub enum CortexError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {action}")]
    Forbidden { action: String },

    #[error("Unknown tenant for host: {host}")]
    TenantUnknown { host: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Storage conflict: {code}")]
    BackendConflict { code: String },

    #[error("Storage backend misconfigured: {0}")]
    BackendMisconfigured(String),

    #[error("Embedding service unavailable: {0}")]
    EmbedderUnavailable(String),

    #[error("LLM provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Retrieval failed: {0}")]
    RetrievalFailed(String),

    #[error("query canceled")]
    QueryCanceled,

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CortexError {
    /// Stable error code sent to clients in error frames and JSON bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CortexError::Config(_) => "CONFIG_INVALID",
            CortexError::Unauthenticated(_) => "UNAUTHENTICATED",
            CortexError::Forbidden { .. } => "FORBIDDEN",
            CortexError::TenantUnknown { .. } => "TENANT_UNKNOWN",
            CortexError::NotFound(_) => "NOT_FOUND",
            CortexError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            CortexError::BackendConflict { .. } => "BACKEND_CONFLICT",
            CortexError::BackendMisconfigured(_) => "BACKEND_MISCONFIGURED",
            CortexError::EmbedderUnavailable(_) => "EMBEDDER_UNAVAILABLE",
            CortexError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            CortexError::RetrievalFailed(_) => "RETRIEVAL_FAILED",
            CortexError::QueryCanceled => "QUERY_CANCELED",
            CortexError::Timeout { .. } => "TIMEOUT",
            CortexError::Serialization(_) => "SERIALIZATION_ERROR",
            CortexError::Io(_) => "IO_ERROR",
            CortexError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status used by the gateway when this error surfaces on a
    /// plain HTTP route.
    pub fn http_status(&self) -> u16 {
        match self {
            CortexError::Unauthenticated(_) => 401,
            CortexError::Forbidden { .. } => 403,
            CortexError::BackendConflict { .. } => 409,
            CortexError::BackendUnavailable(_) => 503,
            CortexError::ProviderUnavailable(_) => 503,
            CortexError::Timeout { .. } => 504,
            CortexError::TenantUnknown { .. } => 404,
            CortexError::NotFound(_) => 404,
            CortexError::QueryCanceled => 499,
            _ => 500,
        }
    }

    /// Whether a caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CortexError::BackendUnavailable(_)
                | CortexError::EmbedderUnavailable(_)
                | CortexError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CortexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_not_retryable() {
        let err = CortexError::BackendConflict {
            code: "duplicate".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn forbidden_names_the_action() {
        let err = CortexError::Forbidden {
            action: "users.update".into(),
        };
        assert_eq!(err.http_status(), 403);
        assert!(err.to_string().contains("users.update"));
    }
}
