//! File-backed storage: append-only JSONL files with an in-memory index.
//!
//! Suitable for single-node consumer deployments and tests. Every write
//! appends one JSON line and updates the in-memory state; reads are linear
//! scans, which is fine at this backend's intended corpus sizes.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use cortex_core::types::{
    AuditEntry, DocumentChunk, EpisodicMemory, MemoryNode, MetricEvent, QueryRecord, Scope,
};

use crate::backend::{ScoredChunk, ScoredEpisode, ScoredNode, StorageBackend};
use crate::error::{Result, StorageError};
use crate::vector;

struct FileState {
    nodes: Vec<MemoryNode>,
    episodes: Vec<EpisodicMemory>,
    chunks: Vec<DocumentChunk>,
    queries: Vec<QueryRecord>,
    audits: Vec<AuditEntry>,
    query_ids: HashSet<Uuid>,
    node_ids: HashSet<Uuid>,
    chunk_keys: HashSet<(Uuid, String, String, u32)>,
}

pub struct FileBackend {
    root: PathBuf,
    state: Mutex<FileState>,
    dim: usize,
}

impl FileBackend {
    pub fn open(root: &Path, dim: usize) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let nodes: Vec<MemoryNode> = load_jsonl(&root.join("nodes.jsonl"))?;
        let episodes: Vec<EpisodicMemory> = load_jsonl(&root.join("episodes.jsonl"))?;
        let chunks: Vec<DocumentChunk> = load_jsonl(&root.join("chunks.jsonl"))?;
        let queries: Vec<QueryRecord> = load_jsonl(&root.join("queries.jsonl"))?;
        let audits: Vec<AuditEntry> = load_jsonl(&root.join("audit.jsonl"))?;

        let query_ids = queries.iter().map(|q| q.id).collect();
        let node_ids = nodes.iter().map(|n| n.id).collect();
        let chunk_keys = chunks.iter().map(chunk_key).collect();

        info!(
            root = %root.display(),
            nodes = nodes.len(),
            chunks = chunks.len(),
            "file backend opened"
        );
        Ok(Self {
            root: root.to_path_buf(),
            state: Mutex::new(FileState {
                nodes,
                episodes,
                chunks,
                queries,
                audits,
                query_ids,
                node_ids,
                chunk_keys,
            }),
            dim,
        })
    }

    fn append<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(file))?;
        let line = serde_json::to_string(value)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }
}

fn load_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

fn chunk_key(chunk: &DocumentChunk) -> (Uuid, String, String, u32) {
    (
        chunk.tenant_id,
        chunk.department_id.clone(),
        chunk.file_hash.clone(),
        chunk.chunk_index,
    )
}

fn chunk_in_scope(chunk: &DocumentChunk, scope: &Scope) -> bool {
    match scope {
        Scope::Tenant { tenant_id } => chunk.tenant_id == *tenant_id,
        Scope::Departments {
            tenant_id,
            department_ids,
        } => chunk.tenant_id == *tenant_id && department_ids.contains(&chunk.department_id),
        Scope::User { .. } => false,
    }
}

fn node_in_scope(user_id: Option<Uuid>, tenant_id: Option<Uuid>, scope: &Scope) -> bool {
    match scope {
        Scope::User { user_id: want } => user_id == Some(*want),
        Scope::Tenant { tenant_id: want } => user_id.is_none() && tenant_id == Some(*want),
        Scope::Departments { .. } => false,
    }
}

/// Token-overlap keyword score in [0, 1].
fn keyword_score(query: &str, content: &str, keywords: &[String]) -> f32 {
    let query_tokens: HashSet<String> = tokenize(query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let mut haystack = tokenize(content);
    for kw in keywords {
        haystack.extend(tokenize(kw));
    }
    let matched = query_tokens.iter().filter(|t| haystack.contains(*t)).count();
    matched as f32 / query_tokens.len() as f32
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn verify(&self) -> Result<()> {
        // The data directory must stay writable for the append path.
        let probe = self.root.join(".probe");
        std::fs::write(&probe, b"ok")?;
        std::fs::remove_file(&probe)?;
        Ok(())
    }

    async fn get_nodes(
        &self,
        scope: &Scope,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryNode>> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock().unwrap();
        let mut matched: Vec<MemoryNode> = state
            .nodes
            .iter()
            .filter(|n| node_in_scope(n.user_id, n.tenant_id, scope))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn vector_search_nodes(
        &self,
        scope: &Scope,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredNode>> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock().unwrap();
        let mut scored: Vec<ScoredNode> = state
            .nodes
            .iter()
            .filter(|n| node_in_scope(n.user_id, n.tenant_id, scope))
            .filter_map(|n| {
                let emb = n.embedding.as_deref()?;
                let score = vector::cosine(query_vec, emb);
                (score >= min_score).then(|| ScoredNode {
                    node: n.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.node.id.cmp(&b.node.id)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn vector_search_episodes(
        &self,
        scope: &Scope,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredEpisode>> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock().unwrap();
        let mut scored: Vec<ScoredEpisode> = state
            .episodes
            .iter()
            .filter(|e| node_in_scope(e.user_id, e.tenant_id, scope))
            .filter_map(|e| {
                let emb = e.embedding.as_deref()?;
                let score = vector::cosine(query_vec, emb);
                (score >= min_score).then(|| ScoredEpisode {
                    episode: e.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.episode.id.cmp(&b.episode.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn keyword_search_chunks(
        &self,
        scope: &Scope,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock().unwrap();
        let mut scored: Vec<ScoredChunk> = state
            .chunks
            .iter()
            .filter(|c| chunk_in_scope(c, scope))
            .filter_map(|c| {
                let score = keyword_score(query_text, &c.content, &c.keywords);
                (score > 0.0).then(|| ScoredChunk {
                    chunk: c.clone(),
                    content_sim: score,
                    question_sim: None,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.content_sim
                .total_cmp(&a.content_sim)
                .then(a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn vector_search_chunks(
        &self,
        scope: &Scope,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredChunk>> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock().unwrap();
        let mut scored: Vec<ScoredChunk> = state
            .chunks
            .iter()
            .filter(|c| chunk_in_scope(c, scope))
            .filter_map(|c| {
                let emb = c.embedding.as_deref()?;
                let content_sim = vector::cosine(query_vec, emb);
                let question_sim = c
                    .enrichment
                    .as_ref()
                    .and_then(|e| e.question_embedding.as_deref())
                    .map(|q| vector::cosine(query_vec, q));
                let best = question_sim.map_or(content_sim, |q| q.max(content_sim));
                (best >= min_score).then(|| ScoredChunk {
                    chunk: c.clone(),
                    content_sim,
                    question_sim,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            let sa = a.question_sim.map_or(a.content_sim, |q| q.max(a.content_sim));
            let sb = b.question_sim.map_or(b.content_sim, |q| q.max(b.content_sim));
            sb.total_cmp(&sa).then(a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn get_chunks_by_ids(&self, scope: &Scope, ids: &[Uuid]) -> Result<Vec<DocumentChunk>> {
        if scope.is_empty() || ids.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        let state = self.state.lock().unwrap();
        Ok(state
            .chunks
            .iter()
            .filter(|c| wanted.contains(&c.id) && chunk_in_scope(c, scope))
            .cloned()
            .collect())
    }

    async fn insert_node(&self, node: &MemoryNode) -> Result<()> {
        if node.scope_key().is_none() {
            return Err(StorageError::Conflict(
                "memory node has neither user nor tenant scope".into(),
            ));
        }
        if let Some(emb) = &node.embedding {
            vector::check_dim(emb, self.dim)?;
        }
        let mut state = self.state.lock().unwrap();
        if !state.node_ids.insert(node.id) {
            return Ok(()); // idempotent by id
        }
        self.append("nodes.jsonl", node)?;
        state.nodes.push(node.clone());
        Ok(())
    }

    async fn insert_episode(&self, episode: &EpisodicMemory) -> Result<()> {
        if episode.user_id.is_none() && episode.tenant_id.is_none() {
            return Err(StorageError::Conflict(
                "episode has neither user nor tenant scope".into(),
            ));
        }
        let mut state = self.state.lock().unwrap();
        if state.episodes.iter().any(|e| e.id == episode.id) {
            return Ok(());
        }
        self.append("episodes.jsonl", episode)?;
        state.episodes.push(episode.clone());
        Ok(())
    }

    async fn insert_chunks(&self, batch: &[DocumentChunk]) -> Result<usize> {
        for chunk in batch {
            if let Some(emb) = &chunk.embedding {
                vector::check_dim(emb, self.dim)?;
            }
        }
        let mut state = self.state.lock().unwrap();
        let mut inserted = 0usize;
        for chunk in batch {
            if !state.chunk_keys.insert(chunk_key(chunk)) {
                continue;
            }
            self.append("chunks.jsonl", chunk)?;
            state.chunks.push(chunk.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn record_query(&self, record: &QueryRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.query_ids.insert(record.id) {
            return Err(StorageError::Conflict(format!(
                "query record {} already exists",
                record.id
            )));
        }
        self.append("queries.jsonl", record)?;
        state.queries.push(record.clone());
        Ok(())
    }

    async fn record_event(&self, event: &MetricEvent) -> Result<()> {
        self.append("events.jsonl", event)
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.append("audit.jsonl", entry)?;
        state.audits.push(entry.clone());
        Ok(())
    }

    async fn recent_session_queries(
        &self,
        tenant_id: Uuid,
        user_email: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<QueryRecord>> {
        let state = self.state.lock().unwrap();
        let mut matched: Vec<QueryRecord> = state
            .queries
            .iter()
            .filter(|q| {
                q.tenant_id == tenant_id
                    && q.user_email == user_email
                    && q.session_id == session_id
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn queries_since(
        &self,
        tenant_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryRecord>> {
        let state = self.state.lock().unwrap();
        let mut matched: Vec<QueryRecord> = state
            .queries
            .iter()
            .filter(|q| q.tenant_id == tenant_id && q.created_at >= since)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matched)
    }

    async fn audit_entries(
        &self,
        tenant_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEntry>> {
        let state = self.state.lock().unwrap();
        let mut matched: Vec<AuditEntry> = state
            .audits
            .iter()
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_core::types::MemorySource;

    fn backend() -> (FileBackend, PathBuf) {
        let dir = std::env::temp_dir().join(format!("cortex-file-{}", Uuid::new_v4()));
        (FileBackend::open(&dir, 4).unwrap(), dir)
    }

    fn node(user: Uuid) -> MemoryNode {
        MemoryNode {
            id: Uuid::new_v4(),
            user_id: Some(user),
            tenant_id: None,
            conversation_id: Uuid::new_v4(),
            sequence_index: 0,
            human_content: "where is the vendor list".into(),
            assistant_content: "in the shared drive".into(),
            source: MemorySource::Chat,
            embedding: Some(vec![0.0, 1.0, 0.0, 0.0]),
            tags: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn nodes_survive_reopen() {
        let (b, dir) = backend();
        let user = Uuid::new_v4();
        b.insert_node(&node(user)).await.unwrap();
        drop(b);

        let reopened = FileBackend::open(&dir, 4).unwrap();
        let scope = Scope::User { user_id: user };
        assert_eq!(reopened.get_nodes(&scope, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replayed_node_insert_is_noop() {
        let (b, _dir) = backend();
        let user = Uuid::new_v4();
        let n = node(user);
        b.insert_node(&n).await.unwrap();
        b.insert_node(&n).await.unwrap();
        let scope = Scope::User { user_id: user };
        assert_eq!(b.get_nodes(&scope, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_query_record_conflicts() {
        let (b, _dir) = backend();
        let r = sample_record();
        b.record_query(&r).await.unwrap();
        assert!(matches!(
            b.record_query(&r).await.unwrap_err(),
            StorageError::Conflict(_)
        ));
    }

    fn sample_record() -> QueryRecord {
        use cortex_core::types::{QueryIntent, QueryStatus, SessionPattern, Urgency};
        QueryRecord {
            id: Uuid::now_v7(),
            tenant_id: Uuid::new_v4(),
            user_email: "u@example.com".into(),
            department: None,
            session_id: "s1".into(),
            query_text: "q".into(),
            status: QueryStatus::Completed,
            response_time_ms: 10,
            response_length: 5,
            tokens_in: 1,
            tokens_out: 2,
            model: "m".into(),
            category: "lookup".into(),
            keywords: vec![],
            frustration_signals: 0,
            is_repeat: false,
            repeat_of: None,
            query_position_in_session: 1,
            time_since_last_query_ms: None,
            complexity_score: 0.1,
            intent: QueryIntent::InfoSeek,
            specificity: 0.0,
            urgency: Urgency::Low,
            multi_part: false,
            inferred_department: "general".into(),
            department_distribution: Default::default(),
            session_pattern: SessionPattern::SingleQuery,
            created_at: Utc::now(),
        }
    }
}
