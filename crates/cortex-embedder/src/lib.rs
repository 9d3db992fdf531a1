pub mod batcher;
pub mod cache;
pub mod client;
pub mod error;

pub use batcher::Embedder;
pub use cache::EmbedCache;
pub use client::{EmbedTransport, HttpEmbedTransport};
pub use error::EmbedError;
