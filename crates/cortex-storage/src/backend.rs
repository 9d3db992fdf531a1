use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use cortex_core::types::{
    AuditEntry, DocumentChunk, EpisodicMemory, MemoryNode, MetricEvent, QueryRecord, Scope,
};

use crate::error::Result;

/// A chunk with its similarity scores, pre-fusion. `question_sim` is only
/// present when the chunk carries a synthetic-question embedding.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub content_sim: f32,
    pub question_sim: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: MemoryNode,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct ScoredEpisode {
    pub episode: EpisodicMemory,
    pub score: f32,
}

/// The storage contract shared by the SQL and file backends.
///
/// Every operation carries a [`Scope`]. Fail-secure rule: an empty scope
/// (or a scope kind the entity does not support) returns an empty result
/// without executing any query. All parameters are bound, never
/// interpolated.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Sanity-check schema and indexes. Fatal at startup on failure.
    async fn verify(&self) -> Result<()>;

    async fn get_nodes(&self, scope: &Scope, limit: usize, offset: usize)
        -> Result<Vec<MemoryNode>>;

    async fn vector_search_nodes(
        &self,
        scope: &Scope,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredNode>>;

    async fn vector_search_episodes(
        &self,
        scope: &Scope,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredEpisode>>;

    async fn keyword_search_chunks(
        &self,
        scope: &Scope,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    async fn vector_search_chunks(
        &self,
        scope: &Scope,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredChunk>>;

    /// Fetch specific chunks (prerequisite expansion). Ids outside the
    /// scope are silently dropped.
    async fn get_chunks_by_ids(&self, scope: &Scope, ids: &[Uuid]) -> Result<Vec<DocumentChunk>>;

    /// Idempotent by node id; replaying an insert is a no-op.
    async fn insert_node(&self, node: &MemoryNode) -> Result<()>;

    async fn insert_episode(&self, episode: &EpisodicMemory) -> Result<()>;

    /// Idempotent by `(tenant, department, file_hash, chunk_index)`.
    /// Returns the number of rows actually inserted.
    async fn insert_chunks(&self, batch: &[DocumentChunk]) -> Result<usize>;

    /// Plain insert: a duplicate id is a [`StorageError::Conflict`],
    /// never a silent duplicate row.
    async fn record_query(&self, record: &QueryRecord) -> Result<()>;

    async fn record_event(&self, event: &MetricEvent) -> Result<()>;

    async fn record_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Most recent queries for one session, newest first.
    async fn recent_session_queries(
        &self,
        tenant_id: Uuid,
        user_email: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<QueryRecord>>;

    /// All query records for a tenant since `since`, oldest first.
    async fn queries_since(
        &self,
        tenant_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryRecord>>;

    async fn audit_entries(
        &self,
        tenant_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEntry>>;
}
