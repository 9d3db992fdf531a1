use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EmbedError {
    /// Upstream failed after the bounded retry budget.
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    /// Response vectors did not match the configured dimension.
    #[error("embedding dimension mismatch: got {got}, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },

    /// The batching task has shut down.
    #[error("embedder is shut down")]
    Closed,
}

impl From<EmbedError> for cortex_core::CortexError {
    fn from(err: EmbedError) -> Self {
        match err {
            EmbedError::Unavailable(msg) => cortex_core::CortexError::EmbedderUnavailable(msg),
            EmbedError::DimensionMismatch { got, expected } => {
                cortex_core::CortexError::EmbedderUnavailable(format!(
                    "dimension mismatch: got {}, expected {}",
                    got, expected
                ))
            }
            EmbedError::Closed => {
                cortex_core::CortexError::EmbedderUnavailable("embedder closed".into())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EmbedError>;
