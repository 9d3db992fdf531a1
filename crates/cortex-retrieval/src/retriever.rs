//! Dual retriever: tenant knowledge (process lane) and per-user/tenant
//! memory (memory lane), fused into one ranked passage list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cortex_core::config::RetrievalConfig;
use cortex_core::types::{Principal, Scope, TenantMode};
use cortex_core::CortexError;
use cortex_embedder::Embedder;
use cortex_storage::{ScoredChunk, StorageBackend};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Passage, PassageKind, RetrievalOutcome};

static ENTITY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Z]{2,}-?\d+").unwrap());

/// Content-weight used when a chunk has no synthetic-question embedding.
const CONTENT_ONLY_WEIGHT: f32 = 0.80;

pub struct DualRetriever {
    storage: Arc<dyn StorageBackend>,
    embedder: Embedder,
    config: RetrievalConfig,
}

impl DualRetriever {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        embedder: Embedder,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            storage,
            embedder,
            config,
        }
    }

    /// Retrieve for a principal. Lane scoping is derived from the
    /// principal's grants, so a caller can never widen its own access.
    pub async fn retrieve(
        &self,
        principal: &Principal,
        mode: TenantMode,
        query: &str,
    ) -> Result<RetrievalOutcome, CortexError> {
        let process_scope = if principal.is_super_user {
            Scope::Tenant {
                tenant_id: principal.tenant_id,
            }
        } else {
            Scope::Departments {
                tenant_id: principal.tenant_id,
                department_ids: principal.departments.clone(),
            }
        };
        let memory_scope = match mode {
            TenantMode::Consumer => Scope::User {
                user_id: principal.user_id,
            },
            TenantMode::Enterprise => Scope::Tenant {
                tenant_id: principal.tenant_id,
            },
        };

        let mut degraded = false;
        let query_vec = match self.embedder.embed_one(query).await {
            Ok(vec) => Some(vec),
            Err(e) => {
                warn!(error = %e, "embedder unavailable, keyword-only retrieval");
                degraded = true;
                None
            }
        };

        // Candidate pool is wider than top_k so fusion can reorder.
        let candidates = self.config.top_k * 2;
        let min_score = self.config.min_score;

        // Only lanes actually attempted count toward total failure: with
        // the embedder down, keyword search is the sole attempted lane.
        let mut lanes = LaneCounter::default();

        let (vector_chunks, keyword_chunks, nodes, episodes);
        match &query_vec {
            Some(vec) => {
                let (vc, kc, n, e) = tokio::join!(
                    self.storage
                        .vector_search_chunks(&process_scope, vec, candidates, min_score),
                    self.storage
                        .keyword_search_chunks(&process_scope, query, candidates),
                    self.storage
                        .vector_search_nodes(&memory_scope, vec, candidates, min_score),
                    self.storage
                        .vector_search_episodes(&memory_scope, vec, candidates, min_score),
                );
                vector_chunks = lanes.take("chunks.vector", vc);
                keyword_chunks = lanes.take("chunks.keyword", kc);
                nodes = lanes.take("memory.nodes", n);
                episodes = lanes.take("memory.episodes", e);
            }
            None => {
                let kc = self
                    .storage
                    .keyword_search_chunks(&process_scope, query, candidates)
                    .await;
                vector_chunks = Vec::new();
                keyword_chunks = lanes.take("chunks.keyword", kc);
                nodes = Vec::new();
                episodes = Vec::new();
            }
        }

        if lanes.failed > 0 {
            degraded = true;
        }
        if lanes.attempted > 0 && lanes.failed == lanes.attempted {
            return Err(CortexError::RetrievalFailed(
                "all retrieval lanes failed".into(),
            ));
        }

        let entities = query_entities(query);
        let mut passages = self.fuse_chunks(vector_chunks, keyword_chunks, &entities);

        passages.extend(nodes.into_iter().map(|scored| Passage {
            id: scored.node.id,
            kind: PassageKind::Memory,
            department: None,
            source_file: None,
            section_title: None,
            content: format!(
                "User: {}\nAssistant: {}",
                scored.node.human_content, scored.node.assistant_content
            ),
            score: scored.score,
            importance: 0.0,
            created_at: scored.node.created_at,
            token_count: ((scored.node.human_content.len()
                + scored.node.assistant_content.len())
                / 4) as u32,
            prerequisites: Vec::new(),
        }));
        passages.extend(episodes.into_iter().map(|scored| Passage {
            id: scored.episode.id,
            kind: PassageKind::Episodic,
            department: None,
            source_file: None,
            section_title: None,
            content: scored.episode.summary.clone(),
            score: scored.score,
            importance: 0.0,
            created_at: scored.episode.created_at,
            token_count: (scored.episode.summary.len() / 4) as u32,
            prerequisites: Vec::new(),
        }));

        sort_passages(&mut passages);
        passages.truncate(self.config.top_k);

        self.expand_prerequisites(&process_scope, &mut passages).await;
        sort_passages(&mut passages);

        debug!(
            passages = passages.len(),
            degraded, "retrieval complete"
        );
        Ok(RetrievalOutcome { passages, degraded })
    }

    /// Merge the two chunk lanes (vector wins on overlap) and apply the
    /// fusion formula:
    /// `w_content·cos_content + w_questions·cos_questions + type + entity`,
    /// with the content weight raised to 0.80 when no synthetic-question
    /// embedding exists.
    fn fuse_chunks(
        &self,
        vector_chunks: Vec<ScoredChunk>,
        keyword_chunks: Vec<ScoredChunk>,
        entities: &[String],
    ) -> Vec<Passage> {
        let w = &self.config.weights;
        let mut by_id: HashMap<Uuid, ScoredChunk> = HashMap::new();
        for scored in keyword_chunks {
            by_id.insert(scored.chunk.id, scored);
        }
        for scored in vector_chunks {
            // Vector lane carries real similarities; prefer it on overlap
            // but keep the better content score.
            match by_id.entry(scored.chunk.id) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    existing.content_sim = existing.content_sim.max(scored.content_sim);
                    existing.question_sim = scored.question_sim;
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(scored);
                }
            }
        }

        by_id
            .into_values()
            .map(|scored| {
                let enrichment = scored.chunk.enrichment.as_ref();
                let type_bonus = enrichment
                    .map(|e| !e.synthetic_questions.is_empty() || !e.prerequisites.is_empty())
                    .unwrap_or(false) as u8 as f32;
                let entity_bonus = entity_overlap(entities, &scored.chunk.content);

                let score = match scored.question_sim {
                    Some(question_sim) => {
                        w.content * scored.content_sim
                            + w.questions * question_sim
                            + w.type_bonus * type_bonus
                            + w.entity_bonus * entity_bonus
                    }
                    None => {
                        CONTENT_ONLY_WEIGHT * scored.content_sim
                            + w.type_bonus * type_bonus
                            + w.entity_bonus * entity_bonus
                    }
                };

                Passage {
                    id: scored.chunk.id,
                    kind: PassageKind::Process,
                    department: Some(scored.chunk.department_id.clone()),
                    source_file: Some(scored.chunk.source_file.clone()),
                    section_title: Some(scored.chunk.section_title.clone()),
                    content: scored.chunk.content.clone(),
                    score,
                    importance: enrichment.map(|e| e.importance).unwrap_or(0.0),
                    created_at: scored.chunk.created_at,
                    token_count: scored.chunk.token_count,
                    prerequisites: enrichment
                        .map(|e| e.prerequisites.clone())
                        .unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Pull in declared prerequisites of the top passages (scope-checked
    /// by the backend). Each lands just below its dependent in the order.
    async fn expand_prerequisites(&self, scope: &Scope, passages: &mut Vec<Passage>) {
        let present: HashSet<Uuid> = passages.iter().map(|p| p.id).collect();
        let mut wanted: Vec<(Uuid, f32)> = Vec::new();
        for passage in passages.iter().take(self.config.expand_top) {
            for prereq in &passage.prerequisites {
                if !present.contains(prereq) && !wanted.iter().any(|(id, _)| id == prereq) {
                    wanted.push((*prereq, passage.score * 0.95));
                }
            }
        }
        if wanted.is_empty() {
            return;
        }

        let ids: Vec<Uuid> = wanted.iter().map(|(id, _)| *id).collect();
        let chunks = match self.storage.get_chunks_by_ids(scope, &ids).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, "prerequisite expansion failed");
                return;
            }
        };
        for chunk in chunks {
            let score = wanted
                .iter()
                .find(|(id, _)| *id == chunk.id)
                .map(|(_, s)| *s)
                .unwrap_or(0.0);
            passages.push(Passage {
                id: chunk.id,
                kind: PassageKind::Process,
                department: Some(chunk.department_id.clone()),
                source_file: Some(chunk.source_file.clone()),
                section_title: Some(chunk.section_title.clone()),
                content: chunk.content.clone(),
                score,
                importance: chunk
                    .enrichment
                    .as_ref()
                    .map(|e| e.importance)
                    .unwrap_or(0.0),
                created_at: chunk.created_at,
                token_count: chunk.token_count,
                prerequisites: Vec::new(),
            });
        }
    }
}

#[derive(Default)]
struct LaneCounter {
    attempted: usize,
    failed: usize,
}

impl LaneCounter {
    fn take<T>(
        &mut self,
        label: &str,
        res: Result<Vec<T>, cortex_storage::StorageError>,
    ) -> Vec<T> {
        self.attempted += 1;
        match res {
            Ok(items) => items,
            Err(e) => {
                warn!(lane = label, error = %e, "retrieval lane failed");
                self.failed += 1;
                Vec::new()
            }
        }
    }
}

fn query_entities(query: &str) -> Vec<String> {
    ENTITY_RE
        .find_iter(query)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Fraction of query entities present verbatim in the chunk content.
fn entity_overlap(entities: &[String], content: &str) -> f32 {
    if entities.is_empty() {
        return 0.0;
    }
    let matched = entities.iter().filter(|e| content.contains(*e)).count();
    matched as f32 / entities.len() as f32
}

/// Deterministic total order: score desc, importance desc, recency desc,
/// id asc.
fn sort_passages(passages: &mut [Passage]) {
    passages.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(b.importance.total_cmp(&a.importance))
            .then(b.created_at.cmp(&a.created_at))
            .then(a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use cortex_core::types::{ChunkEnrichment, DocumentChunk, MemoryNode, MemorySource};
    use cortex_embedder::{
        batcher::BatcherSettings, cache::EmbedCache, EmbedError, EmbedTransport, Embedder,
    };
    use cortex_storage::SqlBackend;
    use std::collections::BTreeSet;

    struct FixedTransport {
        fail: bool,
    }

    #[async_trait]
    impl EmbedTransport for FixedTransport {
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, EmbedError> {
            if self.fail {
                return Err(EmbedError::Unavailable("down".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    fn embedder(fail: bool) -> Embedder {
        Embedder::spawn(
            Arc::new(FixedTransport { fail }),
            Arc::new(EmbedCache::in_memory(4).unwrap()),
            BatcherSettings {
                batch_size: 8,
                batch_window_ms: 5,
                workers: 1,
                dim: 4,
            },
        )
    }

    fn principal(tenant: Uuid, depts: &[&str]) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            tenant_id: tenant,
            email: "u@example.com".into(),
            departments: depts.iter().map(|s| s.to_string()).collect(),
            dept_head_for: BTreeSet::new(),
            is_super_user: false,
        }
    }

    fn chunk(tenant: Uuid, dept: &str, idx: u32, content: &str, emb: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            department_id: dept.to_string(),
            source_file: "handbook.md".into(),
            file_hash: "cafef00d".into(),
            section_title: format!("Section {}", idx),
            content: content.to_string(),
            chunk_index: idx,
            parent_document_id: None,
            token_count: 30,
            keywords: vec![],
            category: Some("process".into()),
            subcategory: None,
            embedding: Some(emb),
            enrichment: None,
            created_at: Utc::now(),
        }
    }

    fn retriever(storage: Arc<dyn StorageBackend>, fail_embed: bool) -> DualRetriever {
        DualRetriever::new(storage, embedder(fail_embed), RetrievalConfig::default())
    }

    #[tokio::test]
    async fn empty_department_access_yields_zero_passages() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let tenant = Uuid::new_v4();
        storage
            .insert_chunks(&[chunk(tenant, "logistics", 0, "returns process", vec![1.0, 0.0, 0.0, 0.0])])
            .await
            .unwrap();

        let r = retriever(Arc::clone(&storage), false);
        let p = principal(tenant, &[]);
        let outcome = r
            .retrieve(&p, TenantMode::Consumer, "How do I process returns?")
            .await
            .unwrap();
        assert!(outcome.passages.is_empty());
    }

    #[tokio::test]
    async fn returned_passages_stay_within_readable_departments() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let tenant = Uuid::new_v4();
        storage
            .insert_chunks(&[
                chunk(tenant, "logistics", 0, "returns", vec![1.0, 0.0, 0.0, 0.0]),
                chunk(tenant, "hr", 1, "benefits", vec![1.0, 0.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let r = retriever(Arc::clone(&storage), false);
        let p = principal(tenant, &["logistics"]);
        let outcome = r
            .retrieve(&p, TenantMode::Enterprise, "returns")
            .await
            .unwrap();
        assert!(!outcome.passages.is_empty());
        assert!(outcome
            .passages
            .iter()
            .all(|passage| passage.department.as_deref() != Some("hr")));
    }

    #[tokio::test]
    async fn embedder_failure_degrades_to_keyword_lane() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let tenant = Uuid::new_v4();
        storage
            .insert_chunks(&[chunk(tenant, "logistics", 0, "vendor returns terms", vec![1.0, 0.0, 0.0, 0.0])])
            .await
            .unwrap();

        let r = retriever(Arc::clone(&storage), true);
        let p = principal(tenant, &["logistics"]);
        let outcome = r
            .retrieve(&p, TenantMode::Enterprise, "vendor returns")
            .await
            .unwrap();
        assert!(outcome.degraded);
        assert_eq!(outcome.passages.len(), 1);
    }

    #[tokio::test]
    async fn scores_are_non_increasing_and_capped() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let tenant = Uuid::new_v4();
        let mut batch = Vec::new();
        for i in 0..30 {
            // varying similarity to the fixed query vector
            let x = 1.0 - (i as f32) * 0.02;
            batch.push(chunk(
                tenant,
                "logistics",
                i,
                &format!("returns doc {}", i),
                vec![x, (1.0 - x * x).max(0.0).sqrt(), 0.0, 0.0],
            ));
        }
        storage.insert_chunks(&batch).await.unwrap();

        let r = retriever(Arc::clone(&storage), false);
        let p = principal(tenant, &["logistics"]);
        let outcome = r
            .retrieve(&p, TenantMode::Enterprise, "returns")
            .await
            .unwrap();
        assert!(outcome.passages.len() <= RetrievalConfig::default().top_k);
        for pair in outcome.passages.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn memory_lane_is_scoped_to_the_user() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let tenant = Uuid::new_v4();
        let p = principal(tenant, &["logistics"]);
        let other_user = Uuid::new_v4();

        for (user, text) in [(p.user_id, "my shipment"), (other_user, "their shipment")] {
            storage
                .insert_node(&MemoryNode {
                    id: Uuid::new_v4(),
                    user_id: Some(user),
                    tenant_id: None,
                    conversation_id: Uuid::new_v4(),
                    sequence_index: 0,
                    human_content: text.into(),
                    assistant_content: "noted".into(),
                    source: MemorySource::Chat,
                    embedding: Some(vec![1.0, 0.0, 0.0, 0.0]),
                    tags: vec![],
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let r = retriever(Arc::clone(&storage), false);
        let outcome = r
            .retrieve(&p, TenantMode::Consumer, "shipment status")
            .await
            .unwrap();
        let memories: Vec<&Passage> = outcome
            .passages
            .iter()
            .filter(|p| p.kind == PassageKind::Memory)
            .collect();
        assert_eq!(memories.len(), 1);
        assert!(memories[0].content.contains("my shipment"));
    }

    #[tokio::test]
    async fn prerequisites_are_expanded_within_scope() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let tenant = Uuid::new_v4();

        let prereq = chunk(tenant, "logistics", 0, "label the parcel first", vec![0.0, 1.0, 0.0, 0.0]);
        let mut main = chunk(tenant, "logistics", 1, "returns need a label", vec![1.0, 0.0, 0.0, 0.0]);
        main.enrichment = Some(ChunkEnrichment {
            prerequisites: vec![prereq.id],
            importance: 0.5,
            ..Default::default()
        });
        storage
            .insert_chunks(&[prereq.clone(), main])
            .await
            .unwrap();

        let r = retriever(Arc::clone(&storage), false);
        let p = principal(tenant, &["logistics"]);
        let outcome = r
            .retrieve(&p, TenantMode::Enterprise, "returns")
            .await
            .unwrap();
        assert!(outcome.passages.iter().any(|passage| passage.id == prereq.id));
    }
}
