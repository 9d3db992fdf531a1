use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassageKind {
    /// Tenant knowledge: a document chunk.
    Process,
    /// A prior human/assistant exchange.
    Memory,
    /// A summarized conversation arc.
    Episodic,
}

/// A ranked passage from either lane, ready for prompt assembly.
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub id: Uuid,
    pub kind: PassageKind,
    pub department: Option<String>,
    pub source_file: Option<String>,
    pub section_title: Option<String>,
    pub content: String,
    pub score: f32,
    /// Tie-breaker after score; 0 for memory passages.
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub token_count: u32,
    /// Chunk graph edges pulled in by prerequisite expansion.
    pub prerequisites: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// Total order: scores non-increasing, ties broken by importance then
    /// recency then id.
    pub passages: Vec<Passage>,
    /// True when the embedder was down or a lane failed and results come
    /// from keyword search only (or a subset of lanes).
    pub degraded: bool,
}

impl RetrievalOutcome {
    pub fn empty() -> Self {
        Self {
            passages: Vec::new(),
            degraded: false,
        }
    }
}
