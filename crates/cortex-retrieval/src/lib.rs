pub mod retriever;
pub mod types;

pub use retriever::DualRetriever;
pub use types::{Passage, PassageKind, RetrievalOutcome};
