//! SQLite implementation of the storage contract.
//!
//! Two schemas on two connections: `core.db` holds tenant data (document
//! chunks, query log, audit log, metric events) and `memory.db` holds the
//! per-user data (memory nodes, episodic memories). Vectors are stored as
//! little-endian f32 BLOBs and scanned exactly; FTS5 backs the keyword
//! lane.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use cortex_core::types::{
    AuditEntry, ChunkEnrichment, DocumentChunk, EpisodicMemory, MemoryNode, MetricEvent,
    QueryRecord, Scope,
};

use crate::backend::{ScoredChunk, ScoredEpisode, ScoredNode, StorageBackend};
use crate::error::{Result, StorageError};
use crate::vector;

pub struct SqlBackend {
    core: Mutex<Connection>,
    memory: Mutex<Connection>,
    dim: usize,
}

impl SqlBackend {
    /// Open (or create) the two database files under `dir`.
    pub fn open(dir: &Path, dim: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let core = Connection::open(dir.join("core.db"))?;
        let memory = Connection::open(dir.join("memory.db"))?;
        let backend = Self::from_connections(core, memory, dim)?;
        info!(dir = %dir.display(), dim, "sql backend opened");
        Ok(backend)
    }

    /// Wrap already-open connections (used by tests with `:memory:`).
    pub fn from_connections(core: Connection, memory: Connection, dim: usize) -> Result<Self> {
        init_core_schema(&core)?;
        init_memory_schema(&memory)?;
        Ok(Self {
            core: Mutex::new(core),
            memory: Mutex::new(memory),
            dim,
        })
    }

    pub fn in_memory(dim: usize) -> Result<Self> {
        Self::from_connections(
            Connection::open_in_memory()?,
            Connection::open_in_memory()?,
            dim,
        )
    }
}

/// Idempotent; safe to call on every startup.
fn init_core_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chunks (
            id                  TEXT PRIMARY KEY NOT NULL,
            tenant_id           TEXT NOT NULL,
            department_id       TEXT NOT NULL,
            source_file         TEXT NOT NULL,
            file_hash           TEXT NOT NULL,
            section_title       TEXT NOT NULL,
            content             TEXT NOT NULL,
            chunk_index         INTEGER NOT NULL CHECK (chunk_index >= 0),
            parent_document_id  TEXT,
            token_count         INTEGER NOT NULL CHECK (token_count > 0),
            keywords            TEXT NOT NULL DEFAULT '[]',
            category            TEXT,
            subcategory         TEXT,
            embedding           BLOB,
            question_embedding  BLOB,
            enrichment          TEXT,
            created_at          TEXT NOT NULL,
            UNIQUE(tenant_id, department_id, file_hash, chunk_index)
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_scope
            ON chunks(tenant_id, department_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts
            USING fts5(content, section_title, keywords,
                       content='chunks', content_rowid='rowid');

        CREATE TABLE IF NOT EXISTS query_log (
            id                       TEXT PRIMARY KEY NOT NULL,
            tenant_id                TEXT NOT NULL,
            user_email               TEXT NOT NULL,
            department               TEXT,
            session_id               TEXT NOT NULL,
            query_text               TEXT NOT NULL,
            status                   TEXT NOT NULL,
            response_time_ms         INTEGER NOT NULL,
            response_length          INTEGER NOT NULL,
            tokens_in                INTEGER NOT NULL,
            tokens_out               INTEGER NOT NULL,
            model                    TEXT NOT NULL,
            category                 TEXT NOT NULL,
            keywords                 TEXT NOT NULL DEFAULT '[]',
            frustration_signals      INTEGER NOT NULL DEFAULT 0,
            is_repeat                INTEGER NOT NULL DEFAULT 0,
            repeat_of                TEXT,
            query_position           INTEGER NOT NULL,
            time_since_last_ms       INTEGER,
            complexity_score         REAL NOT NULL,
            intent                   TEXT NOT NULL,
            specificity              REAL NOT NULL,
            urgency                  TEXT NOT NULL,
            multi_part               INTEGER NOT NULL,
            inferred_department      TEXT NOT NULL,
            department_distribution  TEXT NOT NULL DEFAULT '{}',
            session_pattern          TEXT NOT NULL,
            created_at               TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_query_session
            ON query_log(tenant_id, user_email, session_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_query_tenant_time
            ON query_log(tenant_id, created_at);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          TEXT PRIMARY KEY NOT NULL,
            tenant_id   TEXT NOT NULL,
            actor_id    TEXT NOT NULL,
            target_id   TEXT,
            action      TEXT NOT NULL,
            department  TEXT,
            before_json TEXT,
            after_json  TEXT,
            reason      TEXT,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_tenant
            ON audit_log(tenant_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS metric_events (
            seq        INTEGER PRIMARY KEY AUTOINCREMENT,
            payload    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn init_memory_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_nodes (
            id                TEXT PRIMARY KEY NOT NULL,
            user_id           TEXT,
            tenant_id         TEXT,
            conversation_id   TEXT NOT NULL,
            sequence_index    INTEGER NOT NULL,
            human_content     TEXT NOT NULL,
            assistant_content TEXT NOT NULL,
            source            TEXT NOT NULL,
            embedding         BLOB,
            tags              TEXT NOT NULL DEFAULT '[]',
            created_at        TEXT NOT NULL,
            CHECK (user_id IS NOT NULL OR tenant_id IS NOT NULL)
        );
        CREATE INDEX IF NOT EXISTS idx_nodes_user
            ON memory_nodes(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_nodes_tenant
            ON memory_nodes(tenant_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS episodic_memories (
            id              TEXT PRIMARY KEY NOT NULL,
            user_id         TEXT,
            tenant_id       TEXT,
            conversation_id TEXT NOT NULL,
            messages        TEXT NOT NULL DEFAULT '[]',
            summary         TEXT NOT NULL,
            tags            TEXT NOT NULL DEFAULT '[]',
            embedding       BLOB,
            created_at      TEXT NOT NULL,
            CHECK (user_id IS NOT NULL OR tenant_id IS NOT NULL)
        );
        CREATE INDEX IF NOT EXISTS idx_episodes_user
            ON episodic_memories(user_id, created_at DESC);",
    )?;
    Ok(())
}

// ── scope → WHERE fragments (values always bound, never interpolated) ────────

/// WHERE fragment and bound values for chunk queries, or None when the
/// scope kind cannot match chunks (fail-secure).
fn chunk_scope_sql(scope: &Scope) -> Option<(String, Vec<String>)> {
    match scope {
        Scope::Tenant { tenant_id } => Some((
            "tenant_id = ?".to_string(),
            vec![tenant_id.to_string()],
        )),
        Scope::Departments {
            tenant_id,
            department_ids,
        } => {
            if department_ids.is_empty() {
                return None;
            }
            let placeholders = vec!["?"; department_ids.len()].join(", ");
            let mut values = vec![tenant_id.to_string()];
            values.extend(department_ids.iter().cloned());
            Some((
                format!("tenant_id = ? AND department_id IN ({})", placeholders),
                values,
            ))
        }
        // Chunks are never user-scoped.
        Scope::User { .. } => None,
    }
}

/// WHERE fragment for node/episode queries. Tenant scope only matches
/// rows without a user owner so per-user memories never leak tenant-wide.
fn node_scope_sql(scope: &Scope) -> Option<(String, Vec<String>)> {
    match scope {
        Scope::User { user_id } => {
            Some(("user_id = ?".to_string(), vec![user_id.to_string()]))
        }
        Scope::Tenant { tenant_id } => Some((
            "tenant_id = ? AND user_id IS NULL".to_string(),
            vec![tenant_id.to_string()],
        )),
        Scope::Departments { .. } => None,
    }
}

/// Quote each token for FTS5 so user text can never alter query syntax.
fn fts_query(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

// ── row mappers ──────────────────────────────────────────────────────────────

fn parse_uuid(s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_time(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

const CHUNK_SELECT: &str = "SELECT id, tenant_id, department_id, source_file, file_hash,
    section_title, content, chunk_index, parent_document_id, token_count,
    keywords, category, subcategory, embedding, question_embedding,
    enrichment, created_at FROM chunks";

struct ChunkRow {
    chunk: DocumentChunk,
    question_embedding: Option<Vec<f32>>,
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    let keywords: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(10)?).unwrap_or_default();
    let enrichment: Option<ChunkEnrichment> = row
        .get::<_, Option<String>>(15)?
        .and_then(|s| serde_json::from_str(&s).ok());
    let embedding = row
        .get::<_, Option<Vec<u8>>>(13)?
        .map(|b| vector::decode(&b))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                13,
                rusqlite::types::Type::Blob,
                e.to_string().into(),
            )
        })?;
    let question_embedding = row
        .get::<_, Option<Vec<u8>>>(14)?
        .map(|b| vector::decode(&b))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                14,
                rusqlite::types::Type::Blob,
                e.to_string().into(),
            )
        })?;

    Ok(ChunkRow {
        chunk: DocumentChunk {
            id: parse_uuid(row.get(0)?)?,
            tenant_id: parse_uuid(row.get(1)?)?,
            department_id: row.get(2)?,
            source_file: row.get(3)?,
            file_hash: row.get(4)?,
            section_title: row.get(5)?,
            content: row.get(6)?,
            chunk_index: row.get(7)?,
            parent_document_id: row
                .get::<_, Option<String>>(8)?
                .map(parse_uuid)
                .transpose()?,
            token_count: row.get(9)?,
            keywords,
            category: row.get(11)?,
            subcategory: row.get(12)?,
            embedding,
            enrichment,
            created_at: parse_time(row.get(16)?)?,
        },
        question_embedding,
    })
}

const NODE_SELECT: &str = "SELECT id, user_id, tenant_id, conversation_id, sequence_index,
    human_content, assistant_content, source, embedding, tags, created_at
    FROM memory_nodes";

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryNode> {
    let tags: Vec<String> = serde_json::from_str(&row.get::<_, String>(9)?).unwrap_or_default();
    let embedding = row
        .get::<_, Option<Vec<u8>>>(8)?
        .map(|b| vector::decode(&b))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Blob,
                e.to_string().into(),
            )
        })?;
    Ok(MemoryNode {
        id: parse_uuid(row.get(0)?)?,
        user_id: row.get::<_, Option<String>>(1)?.map(parse_uuid).transpose()?,
        tenant_id: row.get::<_, Option<String>>(2)?.map(parse_uuid).transpose()?,
        conversation_id: parse_uuid(row.get(3)?)?,
        sequence_index: row.get(4)?,
        human_content: row.get(5)?,
        assistant_content: row.get(6)?,
        source: row
            .get::<_, String>(7)?
            .parse()
            .unwrap_or(cortex_core::types::MemorySource::Chat),
        embedding,
        tags,
        created_at: parse_time(row.get(10)?)?,
    })
}

const QUERY_SELECT: &str = "SELECT id, tenant_id, user_email, department, session_id,
    query_text, status, response_time_ms, response_length, tokens_in, tokens_out,
    model, category, keywords, frustration_signals, is_repeat, repeat_of,
    query_position, time_since_last_ms, complexity_score, intent, specificity,
    urgency, multi_part, inferred_department, department_distribution,
    session_pattern, created_at FROM query_log";

fn row_to_query(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryRecord> {
    use cortex_core::types::{QueryIntent, QueryStatus, SessionPattern, Urgency};
    Ok(QueryRecord {
        id: parse_uuid(row.get(0)?)?,
        tenant_id: parse_uuid(row.get(1)?)?,
        user_email: row.get(2)?,
        department: row.get(3)?,
        session_id: row.get(4)?,
        query_text: row.get(5)?,
        status: row
            .get::<_, String>(6)?
            .parse()
            .unwrap_or(QueryStatus::Completed),
        response_time_ms: row.get(7)?,
        response_length: row.get(8)?,
        tokens_in: row.get(9)?,
        tokens_out: row.get(10)?,
        model: row.get(11)?,
        category: row.get(12)?,
        keywords: serde_json::from_str(&row.get::<_, String>(13)?).unwrap_or_default(),
        frustration_signals: row.get(14)?,
        is_repeat: row.get::<_, i32>(15)? != 0,
        repeat_of: row.get::<_, Option<String>>(16)?.map(parse_uuid).transpose()?,
        query_position_in_session: row.get(17)?,
        time_since_last_query_ms: row.get(18)?,
        complexity_score: row.get(19)?,
        intent: row
            .get::<_, String>(20)?
            .parse()
            .unwrap_or(QueryIntent::InfoSeek),
        specificity: row.get(21)?,
        urgency: row.get::<_, String>(22)?.parse().unwrap_or(Urgency::Low),
        multi_part: row.get::<_, i32>(23)? != 0,
        inferred_department: row.get(24)?,
        department_distribution: serde_json::from_str(&row.get::<_, String>(25)?)
            .unwrap_or_default(),
        session_pattern: row
            .get::<_, String>(26)?
            .parse()
            .unwrap_or(SessionPattern::SingleQuery),
        created_at: parse_time(row.get(27)?)?,
    })
}

#[async_trait]
impl StorageBackend for SqlBackend {
    async fn verify(&self) -> Result<()> {
        let core = self.core.lock().unwrap();
        let fts: Option<String> = core
            .query_row(
                "SELECT name FROM sqlite_master WHERE name = 'chunks_fts'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if fts.is_none() {
            return Err(StorageError::Misconfigured(
                "chunks_fts index missing".into(),
            ));
        }
        let memory = self.memory.lock().unwrap();
        memory.query_row("SELECT COUNT(*) FROM memory_nodes", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(())
    }

    async fn get_nodes(
        &self,
        scope: &Scope,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryNode>> {
        let Some((where_sql, values)) = node_scope_sql(scope) else {
            return Ok(Vec::new());
        };
        let db = self.memory.lock().unwrap();
        // limit/offset are trusted integers, not caller strings.
        let sql = format!(
            "{} WHERE {} ORDER BY created_at DESC LIMIT {} OFFSET {}",
            NODE_SELECT, where_sql, limit, offset
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_node)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn vector_search_nodes(
        &self,
        scope: &Scope,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredNode>> {
        let Some((where_sql, values)) = node_scope_sql(scope) else {
            return Ok(Vec::new());
        };
        let db = self.memory.lock().unwrap();
        let sql = format!(
            "{} WHERE {} AND embedding IS NOT NULL",
            NODE_SELECT, where_sql
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_node)?;

        let mut scored: Vec<ScoredNode> = rows
            .filter_map(|r| r.ok())
            .filter_map(|node| {
                let emb = node.embedding.as_deref()?;
                let score = vector::cosine(query_vec, emb);
                (score >= min_score).then_some(ScoredNode { node, score })
            })
            .collect();
        sort_scored(&mut scored, |s| s.score, |s| s.node.id);
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
        let Some((where_sql, values)) = node_scope_sql(scope) else {
            return Ok(Vec::new());
        };
        let db = self.memory.lock().unwrap();
        let sql = format!(
            "SELECT id, user_id, tenant_id, conversation_id, messages, summary, tags,
                    embedding, created_at
             FROM episodic_memories WHERE {} AND embedding IS NOT NULL",
            where_sql
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            let embedding = row
                .get::<_, Option<Vec<u8>>>(7)?
                .map(|b| vector::decode(&b))
                .transpose()
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        7,
                        rusqlite::types::Type::Blob,
                        e.to_string().into(),
                    )
                })?;
            Ok(EpisodicMemory {
                id: parse_uuid(row.get(0)?)?,
                user_id: row.get::<_, Option<String>>(1)?.map(parse_uuid).transpose()?,
                tenant_id: row.get::<_, Option<String>>(2)?.map(parse_uuid).transpose()?,
                conversation_id: parse_uuid(row.get(3)?)?,
                messages: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
                summary: row.get(5)?,
                tags: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
                embedding,
                created_at: parse_time(row.get(8)?)?,
            })
        })?;

        let mut scored: Vec<ScoredEpisode> = rows
            .filter_map(|r| r.ok())
            .filter_map(|episode| {
                let emb = episode.embedding.as_deref()?;
                let score = vector::cosine(query_vec, emb);
                (score >= min_score).then_some(ScoredEpisode { episode, score })
            })
            .collect();
        sort_scored(&mut scored, |s| s.score, |s| s.episode.id);
        scored.truncate(k);
        Ok(scored)
    }

    async fn keyword_search_chunks(
        &self,
        scope: &Scope,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let Some((where_sql, values)) = chunk_scope_sql(scope) else {
            return Ok(Vec::new());
        };
        let Some(match_expr) = fts_query(query_text) else {
            return Ok(Vec::new());
        };

        let db = self.core.lock().unwrap();
        let sql = format!(
            "SELECT c.id, c.tenant_id, c.department_id, c.source_file, c.file_hash,
                    c.section_title, c.content, c.chunk_index, c.parent_document_id,
                    c.token_count, c.keywords, c.category, c.subcategory, c.embedding,
                    c.question_embedding, c.enrichment, c.created_at,
                    bm25(chunks_fts) AS rank
             FROM chunks c
             JOIN chunks_fts f ON c.rowid = f.rowid
             WHERE {} AND chunks_fts MATCH ?
             ORDER BY rank
             LIMIT {}",
            where_sql, k
        );
        let mut stmt = db.prepare(&sql)?;
        let mut bound = values;
        bound.push(match_expr);
        let rows = stmt.query_map(params_from_iter(bound.iter()), |row| {
            let chunk_row = row_to_chunk(row)?;
            let rank: f64 = row.get(17)?;
            Ok((chunk_row, rank))
        })?;

        Ok(rows
            .filter_map(|r| r.ok())
            .map(|(chunk_row, rank)| {
                // bm25 is lower-is-better (often negative); map to (0, 1].
                let score = 1.0 / (1.0 + rank.max(0.0) as f32);
                ScoredChunk {
                    chunk: chunk_row.chunk,
                    content_sim: score,
                    question_sim: None,
                }
            })
            .collect())
    }

    async fn vector_search_chunks(
        &self,
        scope: &Scope,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredChunk>> {
        let Some((where_sql, values)) = chunk_scope_sql(scope) else {
            return Ok(Vec::new());
        };
        let db = self.core.lock().unwrap();
        let sql = format!(
            "{} WHERE {} AND embedding IS NOT NULL",
            CHUNK_SELECT, where_sql
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_chunk)?;

        let mut scored: Vec<ScoredChunk> = rows
            .filter_map(|r| r.ok())
            .filter_map(|row| {
                let emb = row.chunk.embedding.as_deref()?;
                let content_sim = vector::cosine(query_vec, emb);
                let question_sim = row
                    .question_embedding
                    .as_deref()
                    .map(|q| vector::cosine(query_vec, q));
                let best = question_sim.map_or(content_sim, |q| q.max(content_sim));
                (best >= min_score).then_some(ScoredChunk {
                    chunk: row.chunk,
                    content_sim,
                    question_sim,
                })
            })
            .collect();
        sort_scored(
            &mut scored,
            |s| s.question_sim.map_or(s.content_sim, |q| q.max(s.content_sim)),
            |s| s.chunk.id,
        );
        scored.truncate(k);
        Ok(scored)
    }

    async fn get_chunks_by_ids(&self, scope: &Scope, ids: &[Uuid]) -> Result<Vec<DocumentChunk>> {
        let Some((where_sql, values)) = chunk_scope_sql(scope) else {
            return Ok(Vec::new());
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.core.lock().unwrap();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "{} WHERE {} AND id IN ({})",
            CHUNK_SELECT, where_sql, placeholders
        );
        let mut stmt = db.prepare(&sql)?;
        let mut bound = values;
        bound.extend(ids.iter().map(|id| id.to_string()));
        let rows = stmt.query_map(params_from_iter(bound.iter()), row_to_chunk)?;
        Ok(rows.filter_map(|r| r.ok()).map(|r| r.chunk).collect())
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
        let db = self.memory.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO memory_nodes
             (id, user_id, tenant_id, conversation_id, sequence_index,
              human_content, assistant_content, source, embedding, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                node.id.to_string(),
                node.user_id.map(|u| u.to_string()),
                node.tenant_id.map(|t| t.to_string()),
                node.conversation_id.to_string(),
                node.sequence_index,
                node.human_content,
                node.assistant_content,
                node.source.to_string(),
                node.embedding.as_deref().map(vector::encode),
                serde_json::to_string(&node.tags)?,
                node.created_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            debug!(node_id = %node.id, "duplicate node insert ignored");
        }
        Ok(())
    }

    async fn insert_episode(&self, episode: &EpisodicMemory) -> Result<()> {
        if episode.user_id.is_none() && episode.tenant_id.is_none() {
            return Err(StorageError::Conflict(
                "episode has neither user nor tenant scope".into(),
            ));
        }
        if let Some(emb) = &episode.embedding {
            vector::check_dim(emb, self.dim)?;
        }
        let db = self.memory.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO episodic_memories
             (id, user_id, tenant_id, conversation_id, messages, summary, tags,
              embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                episode.id.to_string(),
                episode.user_id.map(|u| u.to_string()),
                episode.tenant_id.map(|t| t.to_string()),
                episode.conversation_id.to_string(),
                serde_json::to_string(&episode.messages)?,
                episode.summary,
                serde_json::to_string(&episode.tags)?,
                episode.embedding.as_deref().map(vector::encode),
                episode.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn insert_chunks(&self, batch: &[DocumentChunk]) -> Result<usize> {
        for chunk in batch {
            if let Some(emb) = &chunk.embedding {
                vector::check_dim(emb, self.dim)?;
            }
        }
        let mut db = self.core.lock().unwrap();
        let tx = db.transaction()?;
        let mut inserted = 0usize;
        for chunk in batch {
            let question_embedding = chunk
                .enrichment
                .as_ref()
                .and_then(|e| e.question_embedding.as_deref())
                .map(vector::encode);
            let changed = tx.execute(
                "INSERT OR IGNORE INTO chunks
                 (id, tenant_id, department_id, source_file, file_hash, section_title,
                  content, chunk_index, parent_document_id, token_count, keywords,
                  category, subcategory, embedding, question_embedding, enrichment,
                  created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                         ?14, ?15, ?16, ?17)",
                params![
                    chunk.id.to_string(),
                    chunk.tenant_id.to_string(),
                    chunk.department_id,
                    chunk.source_file,
                    chunk.file_hash,
                    chunk.section_title,
                    chunk.content,
                    chunk.chunk_index,
                    chunk.parent_document_id.map(|p| p.to_string()),
                    chunk.token_count,
                    serde_json::to_string(&chunk.keywords)?,
                    chunk.category,
                    chunk.subcategory,
                    chunk.embedding.as_deref().map(vector::encode),
                    question_embedding,
                    chunk
                        .enrichment
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    chunk.created_at.to_rfc3339(),
                ],
            )?;
            if changed > 0 {
                inserted += 1;
                // Sync the external-content FTS index for the new row.
                tx.execute(
                    "INSERT INTO chunks_fts(rowid, content, section_title, keywords)
                     VALUES (last_insert_rowid(), ?1, ?2, ?3)",
                    params![
                        chunk.content,
                        chunk.section_title,
                        chunk.keywords.join(" "),
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    async fn record_query(&self, record: &QueryRecord) -> Result<()> {
        let db = self.core.lock().unwrap();
        db.execute(
            "INSERT INTO query_log
             (id, tenant_id, user_email, department, session_id, query_text, status,
              response_time_ms, response_length, tokens_in, tokens_out, model,
              category, keywords, frustration_signals, is_repeat, repeat_of,
              query_position, time_since_last_ms, complexity_score, intent,
              specificity, urgency, multi_part, inferred_department,
              department_distribution, session_pattern, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                     ?27, ?28)",
            params![
                record.id.to_string(),
                record.tenant_id.to_string(),
                record.user_email,
                record.department,
                record.session_id,
                record.query_text,
                record.status.to_string(),
                record.response_time_ms,
                record.response_length,
                record.tokens_in,
                record.tokens_out,
                record.model,
                record.category,
                serde_json::to_string(&record.keywords)?,
                record.frustration_signals,
                record.is_repeat as i32,
                record.repeat_of.map(|r| r.to_string()),
                record.query_position_in_session,
                record.time_since_last_query_ms,
                record.complexity_score,
                record.intent.to_string(),
                record.specificity,
                record.urgency.to_string(),
                record.multi_part as i32,
                record.inferred_department,
                serde_json::to_string(&record.department_distribution)?,
                record.session_pattern.to_string(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn record_event(&self, event: &MetricEvent) -> Result<()> {
        let db = self.core.lock().unwrap();
        db.execute(
            "INSERT INTO metric_events (payload, created_at) VALUES (?1, ?2)",
            params![serde_json::to_string(event)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<()> {
        let db = self.core.lock().unwrap();
        db.execute(
            "INSERT INTO audit_log
             (id, tenant_id, actor_id, target_id, action, department,
              before_json, after_json, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id.to_string(),
                entry.tenant_id.to_string(),
                entry.actor_id.to_string(),
                entry.target_id.map(|t| t.to_string()),
                entry.action,
                entry.department,
                entry.before.as_ref().map(serde_json::to_string).transpose()?,
                entry.after.as_ref().map(serde_json::to_string).transpose()?,
                entry.reason,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn recent_session_queries(
        &self,
        tenant_id: Uuid,
        user_email: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<QueryRecord>> {
        let db = self.core.lock().unwrap();
        let sql = format!(
            "{} WHERE tenant_id = ?1 AND user_email = ?2 AND session_id = ?3
             ORDER BY created_at DESC LIMIT ?4",
            QUERY_SELECT
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            params![tenant_id.to_string(), user_email, session_id, limit],
            row_to_query,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn queries_since(
        &self,
        tenant_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryRecord>> {
        let db = self.core.lock().unwrap();
        let sql = format!(
            "{} WHERE tenant_id = ?1 AND created_at >= ?2 ORDER BY created_at ASC",
            QUERY_SELECT
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            params![tenant_id.to_string(), since.to_rfc3339()],
            row_to_query,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn audit_entries(
        &self,
        tenant_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEntry>> {
        let db = self.core.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, tenant_id, actor_id, target_id, action, department,
                    before_json, after_json, reason, created_at
             FROM audit_log WHERE tenant_id = ?1
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![tenant_id.to_string(), limit, offset], |row| {
            Ok(AuditEntry {
                id: parse_uuid(row.get(0)?)?,
                tenant_id: parse_uuid(row.get(1)?)?,
                actor_id: parse_uuid(row.get(2)?)?,
                target_id: row.get::<_, Option<String>>(3)?.map(parse_uuid).transpose()?,
                action: row.get(4)?,
                department: row.get(5)?,
                before: row
                    .get::<_, Option<String>>(6)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                after: row
                    .get::<_, Option<String>>(7)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                reason: row.get(8)?,
                created_at: parse_time(row.get(9)?)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

/// Deterministic ordering: score descending, then id ascending so ties
/// break identically for a fixed corpus.
fn sort_scored<T>(items: &mut [T], score: impl Fn(&T) -> f32, id: impl Fn(&T) -> Uuid) {
    items.sort_by(|a, b| {
        score(b)
            .total_cmp(&score(a))
            .then_with(|| id(a).cmp(&id(b)))
    });
}
