pub mod backend;
pub mod error;
pub mod file;
pub mod sql;
pub mod vector;

pub use backend::{ScoredChunk, ScoredNode, StorageBackend};
pub use error::{Result, StorageError};
pub use file::FileBackend;
pub use sql::SqlBackend;
