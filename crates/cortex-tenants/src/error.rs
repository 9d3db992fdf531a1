use thiserror::Error;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("catalog file error: {0}")]
    CatalogLoad(String),

    #[error("tenant profile invalid ({slug}): {reason}")]
    ProfileInvalid { slug: String, reason: String },

    #[error("unknown tenant slug: {0}")]
    UnknownSlug(String),
}

impl From<TenantError> for cortex_core::CortexError {
    fn from(err: TenantError) -> Self {
        match err {
            // Malformed profiles are a startup failure, not a request failure.
            TenantError::CatalogLoad(msg) => cortex_core::CortexError::Config(msg),
            TenantError::ProfileInvalid { slug, reason } => {
                cortex_core::CortexError::Config(format!("tenant '{}': {}", slug, reason))
            }
            TenantError::UnknownSlug(slug) => {
                cortex_core::CortexError::TenantUnknown { host: slug }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TenantError>;
