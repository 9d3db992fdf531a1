pub mod pipeline;

pub use pipeline::{CompletedExchange, MemoryHandle, MemoryPipeline};
