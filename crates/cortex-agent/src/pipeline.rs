//! The cognitive pipeline — one query's journey from text to streamed
//! reply.
//!
//! ```text
//!    RESOLVE ─► RETRIEVE ─► PROMPT ─► STREAM ─► FINALIZE ─► DONE
//!       │          │          │         │           │
//!       └── FAIL ──┴── FAIL ──┴── FAIL ─┴── ABORT ──┘
//! ```
//!
//! RESOLVE runs the cheap classifier and heuristics; RETRIEVE races the
//! dual retriever against a wall-clock budget (degraded on timeout, never
//! fatal); PROMPT assembles the system prompt under a token budget;
//! STREAM forwards tokens with a small coalescing window and handles
//! mid-stream action tags; FINALIZE fans out to analytics and memory
//! without delaying the done frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use cortex_analytics::AnalyticsHandle;
use cortex_core::config::{LlmConfig, COALESCE_WINDOW_MS};
use cortex_core::types::{
    MemorySource, MetricEvent, Principal, QueryRecord, QueryStatus, Scope, TenantMode,
};
use cortex_embedder::Embedder;
use cortex_heuristics::{classify, HeuristicsEngine};
use cortex_identity::predicates;
use cortex_memory::{CompletedExchange, MemoryHandle};
use cortex_protocol::frames::{CitedPassage, ServerFrame};
use cortex_retrieval::{DualRetriever, RetrievalOutcome};
use cortex_storage::StorageBackend;
use cortex_tenants::TenantProfile;

use crate::actions::{ActionTag, ScanOut, TagScanner};
use crate::prompt::{approx_tokens, PromptBuilder};
use crate::provider::{ChatRequest, LlmProvider, Message, Role};
use crate::stream::StreamEvent;

/// How many recent session records inform repeat detection and position.
const SESSION_LOOKBACK: usize = 10;
/// Matches returned per mid-stream tool invocation.
const TOOL_RESULT_LIMIT: usize = 5;
/// Tool result snippets are truncated to this many characters.
const TOOL_SNIPPET_CHARS: usize = 600;

pub struct PipelineSettings {
    pub llm: LlmConfig,
    pub retrieval_timeout_ms: u64,
    pub max_tool_calls: usize,
    pub query_text_max: usize,
    pub passage_token_budget: usize,
}

pub struct CognitivePipeline {
    provider: Arc<dyn LlmProvider>,
    retriever: Arc<DualRetriever>,
    heuristics: Arc<HeuristicsEngine>,
    analytics: AnalyticsHandle,
    memory: MemoryHandle,
    storage: Arc<dyn StorageBackend>,
    embedder: Embedder,
    settings: PipelineSettings,
}

pub struct QueryRequest {
    pub principal: Principal,
    pub tenant: Arc<TenantProfile>,
    pub query_text: String,
    pub session_id: String,
    pub department_override: Option<String>,
}

/// Where the STREAM stage ended up.
enum StreamOutcome {
    Completed,
    Canceled,
    FailedBeforeFirstToken,
    FailedMidstream,
}

struct ReportedUsage {
    model: String,
    tokens_in: u32,
    tokens_out: u32,
}

impl CognitivePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        retriever: Arc<DualRetriever>,
        heuristics: Arc<HeuristicsEngine>,
        analytics: AnalyticsHandle,
        memory: MemoryHandle,
        storage: Arc<dyn StorageBackend>,
        embedder: Embedder,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            provider,
            retriever,
            heuristics,
            analytics,
            memory,
            storage,
            embedder,
            settings,
        }
    }

    /// Run one query end to end, writing outbound frames to `out`.
    /// Cancelling `cancel` aborts the LLM read and in-flight retrieval;
    /// a QueryRecord is written for every outcome, including cancellation.
    pub async fn handle_query(
        &self,
        req: QueryRequest,
        out: mpsc::Sender<ServerFrame>,
        cancel: CancellationToken,
    ) {
        let query_id = Uuid::now_v7();
        let span = tracing::info_span!(
            "query",
            tenant_id = %req.principal.tenant_id,
            user_id = %req.principal.user_id,
            query_id = %query_id,
        );
        self.run(query_id, req, out, cancel).instrument(span).await;
    }

    async fn run(
        &self,
        query_id: Uuid,
        req: QueryRequest,
        out: mpsc::Sender<ServerFrame>,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        self.analytics.record_event(MetricEvent::QueryStart {
            query_id,
            tenant_id: req.principal.tenant_id,
            at: Utc::now(),
        });

        // ── RESOLVE ──────────────────────────────────────────────────────

        let department = match self.effective_department(&req) {
            Ok(department) => department,
            Err(action) => {
                let _ = out
                    .send(ServerFrame::error("FORBIDDEN", format!("not permitted: {}", action)))
                    .await;
                self.analytics.record_event(MetricEvent::Error {
                    query_id: Some(query_id),
                    code: "FORBIDDEN".into(),
                });
                return;
            }
        };

        let analysis = self.heuristics.analyze(&req.query_text);
        let keywords = classify::extract_keywords(&req.query_text, 8);
        let category = self.heuristics.classify_category(&req.query_text).to_string();
        let inference = self.heuristics.infer_department(
            &req.query_text,
            &keywords,
            &req.tenant.department_slugs(),
        );
        let frustration = classify::frustration_signals(&req.query_text);

        let recent = self
            .storage
            .recent_session_queries(
                req.principal.tenant_id,
                &req.principal.email,
                &req.session_id,
                SESSION_LOOKBACK,
            )
            .await
            .unwrap_or_default();
        let position = recent
            .first()
            .map(|r| r.query_position_in_session + 1)
            .unwrap_or(1);
        let time_since_last = recent
            .first()
            .map(|r| (Utc::now() - r.created_at).num_milliseconds().max(0) as u64);
        let normalized = classify::normalize_for_repeat(&req.query_text);
        let repeat_of = recent
            .iter()
            .find(|r| classify::normalize_for_repeat(&r.query_text) == normalized)
            .map(|r| r.id);
        let pattern = self
            .heuristics
            .session_pattern(req.principal.tenant_id, &req.principal.email, &req.session_id)
            .await;

        let _ = out
            .send(ServerFrame::trace(
                "resolve",
                serde_json::json!({
                    "category": &category,
                    "intent": analysis.intent,
                    "urgency": analysis.urgency,
                    "department": &inference.primary,
                    "session_pattern": pattern.pattern,
                }),
            ))
            .await;

        // The analytics copy of the query text is truncated; retrieval and
        // the LLM always see the full text.
        let mut record = QueryRecord {
            id: query_id,
            tenant_id: req.principal.tenant_id,
            user_email: req.principal.email.clone(),
            department: department.clone(),
            session_id: req.session_id.clone(),
            query_text: truncate_chars(&req.query_text, self.settings.query_text_max),
            status: QueryStatus::Completed,
            response_time_ms: 0,
            response_length: 0,
            tokens_in: 0,
            tokens_out: 0,
            model: self.settings.llm.model.clone(),
            category,
            keywords: keywords.clone(),
            frustration_signals: frustration,
            is_repeat: repeat_of.is_some(),
            repeat_of,
            query_position_in_session: position,
            time_since_last_query_ms: time_since_last,
            complexity_score: analysis.complexity_score,
            intent: analysis.intent,
            specificity: analysis.specificity,
            urgency: analysis.urgency,
            multi_part: analysis.multi_part,
            inferred_department: inference.primary.clone(),
            department_distribution: inference.distribution.clone(),
            session_pattern: pattern.pattern,
            created_at: Utc::now(),
        };

        // ── RETRIEVE ─────────────────────────────────────────────────────

        let retrieve_started = Instant::now();
        let retrieval_budget = Duration::from_millis(self.settings.retrieval_timeout_ms);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.finalize(record, QueryStatus::Canceled, started, None, "", &req).await;
                return;
            }
            res = tokio::time::timeout(
                retrieval_budget,
                self.retriever.retrieve(&req.principal, req.tenant.mode, &req.query_text),
            ) => match res {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    // Degraded retrieval is not fatal to the query.
                    warn!(error = %e, "retrieval failed, continuing without context");
                    self.analytics.record_event(MetricEvent::Error {
                        query_id: Some(query_id),
                        code: "RETRIEVAL_FAILED".into(),
                    });
                    degraded_outcome()
                }
                Err(_) => {
                    warn!(budget_ms = self.settings.retrieval_timeout_ms, "retrieval timed out");
                    degraded_outcome()
                }
            }
        };
        self.analytics.record_event(MetricEvent::RetrievalLatency {
            query_id,
            ms: retrieve_started.elapsed().as_millis() as u64,
            degraded: outcome.degraded,
        });
        let _ = out
            .send(ServerFrame::trace(
                "retrieve",
                serde_json::json!({
                    "passages": outcome.passages.len(),
                    "degraded": outcome.degraded,
                }),
            ))
            .await;

        // ── PROMPT ───────────────────────────────────────────────────────

        let builder = PromptBuilder::new(self.settings.passage_token_budget);
        let tools_enabled = self.settings.max_tool_calls > 0;
        let (system, kept) =
            builder.build(req.tenant.persona.as_deref(), &outcome.passages, tools_enabled);
        let citations: Vec<CitedPassage> = kept
            .iter()
            .map(|p| CitedPassage {
                id: p.id,
                department: p.department.clone(),
                source_file: p.source_file.clone(),
                section_title: p.section_title.clone(),
                score: p.score,
            })
            .collect();

        let mut messages: Vec<Message> = Vec::new();
        for output in self.memory.recent_session_outputs(&req.session_id) {
            messages.push(Message {
                role: Role::Assistant,
                content: output,
            });
        }
        messages.push(Message {
            role: Role::User,
            content: req.query_text.clone(),
        });

        // ── STREAM ───────────────────────────────────────────────────────

        let stream_started = Instant::now();
        let mut scanner = TagScanner::new();
        let mut full_response = String::new();
        let mut usage = ReportedUsage {
            model: self.settings.llm.model.clone(),
            tokens_in: 0,
            tokens_out: 0,
        };
        let mut first_token_at: Option<Instant> = None;
        let mut tool_calls_used = 0usize;

        let stream_outcome = 'rounds: loop {
            let chat_req = ChatRequest {
                model: self.settings.llm.model.clone(),
                system: system.clone(),
                messages: messages.clone(),
                max_tokens: self.settings.llm.max_tokens,
                stream: true,
            };
            let (ev_tx, mut ev_rx) = mpsc::channel::<StreamEvent>(64);
            let provider = Arc::clone(&self.provider);
            let mut round_task =
                tokio::spawn(async move { provider.send_stream(&chat_req, ev_tx).await });

            let mut round_text = String::new();
            let mut pending_tool: Option<ActionTag> = None;
            let mut coalesce_buf = String::new();
            let mut last_flush = Instant::now();
            let mut round_done = false;

            while !round_done {
                let idle_budget = if first_token_at.is_none() {
                    Duration::from_millis(self.settings.llm.first_token_timeout_ms)
                } else {
                    Duration::from_millis(self.settings.llm.idle_timeout_ms)
                };

                tokio::select! {
                    _ = cancel.cancelled() => {
                        round_task.abort();
                        break 'rounds StreamOutcome::Canceled;
                    }

                    // Coalescing window: buffered text is flushed at most
                    // this late even when the stream stalls briefly.
                    _ = tokio::time::sleep(Duration::from_millis(COALESCE_WINDOW_MS)),
                        if !coalesce_buf.is_empty() =>
                    {
                        send_tokens(&out, &mut coalesce_buf).await;
                        last_flush = Instant::now();
                    }

                    event = tokio::time::timeout(idle_budget, ev_rx.recv()) => match event {
                        Err(_elapsed) => {
                            round_task.abort();
                            break 'rounds if first_token_at.is_none() {
                                StreamOutcome::FailedBeforeFirstToken
                            } else {
                                StreamOutcome::FailedMidstream
                            };
                        }
                        Ok(None) => {
                            // Channel closed without a Done event: the
                            // provider call itself failed.
                            match (&mut round_task).await {
                                Ok(Ok(())) => round_done = true,
                                Ok(Err(e)) => {
                                    warn!(error = %e, "provider stream failed");
                                    break 'rounds if first_token_at.is_none() {
                                        StreamOutcome::FailedBeforeFirstToken
                                    } else {
                                        StreamOutcome::FailedMidstream
                                    };
                                }
                                Err(_) => break 'rounds StreamOutcome::FailedMidstream,
                            }
                        }
                        Ok(Some(StreamEvent::TextDelta { text })) => {
                            if first_token_at.is_none() {
                                first_token_at = Some(Instant::now());
                            }
                            for scanned in scanner.push(&text) {
                                match scanned {
                                    ScanOut::Text(t) => {
                                        full_response.push_str(&t);
                                        round_text.push_str(&t);
                                        coalesce_buf.push_str(&t);
                                    }
                                    ScanOut::Tag(tag) => {
                                        if tool_calls_used < self.settings.max_tool_calls {
                                            pending_tool = Some(tag);
                                        } else {
                                            debug!("tool budget exhausted, tag ignored");
                                        }
                                    }
                                }
                            }
                            if pending_tool.is_some() {
                                // Suspend this completion; the tag itself is
                                // never forwarded.
                                round_task.abort();
                                round_done = true;
                            } else if !coalesce_buf.is_empty()
                                && last_flush.elapsed().as_millis() as u64 >= COALESCE_WINDOW_MS
                            {
                                // A dense stream must still flush within the
                                // coalescing window.
                                send_tokens(&out, &mut coalesce_buf).await;
                                last_flush = Instant::now();
                            }
                        }
                        Ok(Some(StreamEvent::Done { model, tokens_in, tokens_out, .. })) => {
                            if !model.is_empty() {
                                usage.model = model;
                            }
                            if tokens_in > 0 {
                                usage.tokens_in = tokens_in;
                            }
                            if tokens_out > 0 {
                                // Rounds accumulate output tokens.
                                usage.tokens_out += tokens_out;
                            }
                            round_done = true;
                        }
                        Ok(Some(StreamEvent::Error { message })) => {
                            warn!(%message, "stream error event");
                            round_task.abort();
                            break 'rounds if first_token_at.is_none() {
                                StreamOutcome::FailedBeforeFirstToken
                            } else {
                                StreamOutcome::FailedMidstream
                            };
                        }
                    }
                }
            }

            if !coalesce_buf.is_empty() {
                send_tokens(&out, &mut coalesce_buf).await;
            }

            match pending_tool {
                Some(tag) => {
                    tool_calls_used += 1;
                    let result = self.run_tool(&tag, &req).await;
                    let _ = out
                        .send(ServerFrame::trace(
                            "tool",
                            serde_json::json!({ "calls_used": tool_calls_used }),
                        ))
                        .await;
                    if !round_text.is_empty() {
                        messages.push(Message {
                            role: Role::Assistant,
                            content: round_text,
                        });
                    }
                    // Tool output re-enters the completion as a system turn.
                    messages.push(Message {
                        role: Role::System,
                        content: result,
                    });
                }
                None => {
                    // An unterminated tag at end of stream is plain text.
                    if let Some(rest) = scanner.finish() {
                        full_response.push_str(&rest);
                        let _ = out.send(ServerFrame::token(rest)).await;
                    }
                    break 'rounds StreamOutcome::Completed;
                }
            }
        };

        if let Some(first) = first_token_at {
            self.analytics.record_event(MetricEvent::LlmLatency {
                query_id,
                first_token_ms: (first - stream_started).as_millis() as u64,
                total_ms: stream_started.elapsed().as_millis() as u64,
            });
        }

        // ── FINALIZE ─────────────────────────────────────────────────────

        record.model = usage.model.clone();
        record.tokens_in = if usage.tokens_in > 0 {
            usage.tokens_in
        } else {
            approx_tokens(&req.query_text) as u32
        };
        record.tokens_out = if usage.tokens_out > 0 {
            usage.tokens_out
        } else {
            approx_tokens(&full_response) as u32
        };

        match stream_outcome {
            StreamOutcome::Completed => {
                let _ = out
                    .send(ServerFrame::Citation {
                        passages: citations,
                    })
                    .await;
                self.finalize(record, QueryStatus::Completed, started, Some(position), &full_response, &req)
                    .await;
                let _ = out
                    .send(ServerFrame::Done {
                        query_id,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
            }
            StreamOutcome::Canceled => {
                info!("query canceled by caller");
                self.finalize(record, QueryStatus::Canceled, started, None, &full_response, &req)
                    .await;
            }
            StreamOutcome::FailedBeforeFirstToken => {
                let _ = out
                    .send(ServerFrame::error(
                        "PROVIDER_UNAVAILABLE",
                        "the model provider could not be reached",
                    ))
                    .await;
                self.finalize(record, QueryStatus::Failed, started, None, &full_response, &req)
                    .await;
            }
            StreamOutcome::FailedMidstream => {
                let _ = out
                    .send(ServerFrame::error(
                        "PROVIDER_STREAM_FAILED",
                        "the model stream ended unexpectedly",
                    ))
                    .await;
                self.finalize(
                    record,
                    QueryStatus::FailedMidstream,
                    started,
                    None,
                    &full_response,
                    &req,
                )
                .await;
            }
        }
    }

    /// Validate a department override. Unknown slugs are "no access",
    /// never a silent remap.
    fn effective_department(&self, req: &QueryRequest) -> Result<Option<String>, String> {
        match &req.department_override {
            None => Ok(None),
            Some(dept) => {
                if !req.tenant.has_department(dept)
                    || !predicates::can_read_department(&req.principal, dept)
                {
                    return Err(format!("department.read:{}", dept));
                }
                Ok(Some(dept.clone()))
            }
        }
    }

    /// Write the QueryRecord (best-effort, non-blocking) and, for
    /// completed queries only, hand the exchange to the memory pipeline.
    async fn finalize(
        &self,
        mut record: QueryRecord,
        status: QueryStatus,
        started: Instant,
        position: Option<u32>,
        response: &str,
        req: &QueryRequest,
    ) {
        record.status = status;
        record.response_time_ms = started.elapsed().as_millis() as u64;
        record.response_length = approx_tokens(response) as u32;
        self.analytics.record_event(MetricEvent::QueryFinish {
            query_id: record.id,
            status,
            at: Utc::now(),
        });
        self.analytics.record_event(MetricEvent::TokenCounts {
            query_id: record.id,
            tokens_in: record.tokens_in,
            tokens_out: record.tokens_out,
        });
        self.analytics.record_query(record);

        if status == QueryStatus::Completed {
            let (user_id, tenant_id) = match req.tenant.mode {
                TenantMode::Consumer => (Some(req.principal.user_id), None),
                TenantMode::Enterprise => (None, Some(req.principal.tenant_id)),
            };
            self.memory.enqueue(CompletedExchange {
                id: Uuid::new_v4(),
                user_id,
                tenant_id,
                conversation_id: self.memory.conversation_for(&req.session_id),
                sequence_index: position.unwrap_or(1),
                human: req.query_text.clone(),
                assistant: response.to_string(),
                source: MemorySource::Chat,
                tags: Vec::new(),
            });
            self.memory.note_session_output(&req.session_id, response);
        }
    }

    /// Execute a mid-stream action against the storage backend, under the
    /// caller's scope. Results come back as text for re-injection.
    async fn run_tool(&self, tag: &ActionTag, req: &QueryRequest) -> String {
        let process_scope = if req.principal.is_super_user {
            Scope::Tenant {
                tenant_id: req.principal.tenant_id,
            }
        } else {
            Scope::Departments {
                tenant_id: req.principal.tenant_id,
                department_ids: req.principal.departments.clone(),
            }
        };
        let memory_scope = match req.tenant.mode {
            TenantMode::Consumer => Scope::User {
                user_id: req.principal.user_id,
            },
            TenantMode::Enterprise => Scope::Tenant {
                tenant_id: req.principal.tenant_id,
            },
        };

        match tag {
            ActionTag::Grep { term } => {
                match self
                    .storage
                    .keyword_search_chunks(&process_scope, term, TOOL_RESULT_LIMIT)
                    .await
                {
                    Ok(hits) if !hits.is_empty() => {
                        let mut text = format!("Keyword search results for \"{}\":\n", term);
                        for hit in hits {
                            text.push_str(&format!(
                                "- {}: {}\n",
                                hit.chunk.section_title,
                                truncate_chars(&hit.chunk.content, TOOL_SNIPPET_CHARS)
                            ));
                        }
                        text
                    }
                    Ok(_) => format!("No keyword matches for \"{}\".", term),
                    Err(e) => {
                        warn!(error = %e, "grep tool failed");
                        "Search is temporarily unavailable.".to_string()
                    }
                }
            }

            ActionTag::Vector { q } => match self.embedder.embed_one(q).await {
                Ok(vec) => {
                    match self
                        .storage
                        .vector_search_chunks(&process_scope, &vec, TOOL_RESULT_LIMIT, 0.0)
                        .await
                    {
                        Ok(hits) if !hits.is_empty() => {
                            let mut text = format!("Semantic search results for \"{}\":\n", q);
                            for hit in hits {
                                text.push_str(&format!(
                                    "- {}: {}\n",
                                    hit.chunk.section_title,
                                    truncate_chars(&hit.chunk.content, TOOL_SNIPPET_CHARS)
                                ));
                            }
                            text
                        }
                        Ok(_) => format!("No semantic matches for \"{}\".", q),
                        Err(e) => {
                            warn!(error = %e, "vector tool failed");
                            "Search is temporarily unavailable.".to_string()
                        }
                    }
                }
                Err(_) => "Semantic search is temporarily unavailable.".to_string(),
            },

            ActionTag::Squirrel { args } => {
                let key = args.get("key").cloned().unwrap_or_else(|| "note".into());
                let value = args.get("value").cloned().unwrap_or_default();
                let (user_id, tenant_id) = match req.tenant.mode {
                    TenantMode::Consumer => (Some(req.principal.user_id), None),
                    TenantMode::Enterprise => (None, Some(req.principal.tenant_id)),
                };
                self.memory.enqueue(CompletedExchange {
                    id: Uuid::new_v4(),
                    user_id,
                    tenant_id,
                    conversation_id: self.memory.conversation_for(&req.session_id),
                    sequence_index: 0,
                    human: format!("[note] {}", key),
                    assistant: value,
                    source: MemorySource::Chat,
                    tags: vec!["squirrel".into()],
                });
                format!("Stored note \"{}\".", key)
            }

            ActionTag::Episodic { args } => {
                let topic = args
                    .get("topic")
                    .or_else(|| args.get("q"))
                    .cloned()
                    .unwrap_or_else(|| req.query_text.clone());
                match self.embedder.embed_one(&topic).await {
                    Ok(vec) => match self
                        .storage
                        .vector_search_episodes(&memory_scope, &vec, TOOL_RESULT_LIMIT, 0.0)
                        .await
                    {
                        Ok(hits) if !hits.is_empty() => {
                            let mut text =
                                format!("Earlier conversations about \"{}\":\n", topic);
                            for hit in hits {
                                text.push_str(&format!(
                                    "- {}\n",
                                    truncate_chars(&hit.episode.summary, TOOL_SNIPPET_CHARS)
                                ));
                            }
                            text
                        }
                        Ok(_) => format!("No earlier conversations about \"{}\".", topic),
                        Err(e) => {
                            warn!(error = %e, "episodic tool failed");
                            "Memory search is temporarily unavailable.".to_string()
                        }
                    },
                    Err(_) => "Memory search is temporarily unavailable.".to_string(),
                }
            }
        }
    }
}

fn degraded_outcome() -> RetrievalOutcome {
    RetrievalOutcome {
        passages: Vec::new(),
        degraded: true,
    }
}

async fn send_tokens(out: &mpsc::Sender<ServerFrame>, buf: &mut String) {
    let text = std::mem::take(buf);
    let _ = out.send(ServerFrame::Token { text }).await;
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cortex_analytics::AnalyticsRecorder;
    use cortex_core::config::{MemoryConfig, RetrievalConfig};
    use cortex_core::types::DocumentChunk;
    use cortex_embedder::{
        batcher::BatcherSettings, cache::EmbedCache, EmbedError, EmbedTransport,
    };
    use cortex_memory::MemoryPipeline;
    use cortex_storage::SqlBackend;
    use cortex_tenants::profile::{AuthMethod, Branding, DepartmentDef};
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    struct FixedTransport;

    #[async_trait]
    impl EmbedTransport for FixedTransport {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    /// Scripted provider: each send_stream call pops the next round of
    /// events; requests are captured for assertions.
    struct ScriptedProvider {
        rounds: Mutex<Vec<Vec<StreamEvent>>>,
        requests: Mutex<Vec<ChatRequest>>,
        /// When true, the stream hangs after its events until canceled.
        hang_after: bool,
    }

    impl ScriptedProvider {
        fn new(rounds: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: Mutex::new(rounds),
                requests: Mutex::new(Vec::new()),
                hang_after: false,
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(
            &self,
            _req: &ChatRequest,
        ) -> Result<crate::provider::ChatResponse, crate::provider::ProviderError> {
            unreachable!("pipeline always streams")
        }

        async fn send_stream(
            &self,
            req: &ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), crate::provider::ProviderError> {
            self.requests.lock().unwrap().push(req.clone());
            let round = {
                let mut rounds = self.rounds.lock().unwrap();
                if rounds.is_empty() {
                    Vec::new()
                } else {
                    rounds.remove(0)
                }
            };
            for event in round {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
            if self.hang_after {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    struct Harness {
        pipeline: CognitivePipeline,
        storage: Arc<dyn StorageBackend>,
        memory_worker: MemoryPipeline,
        analytics_worker: AnalyticsRecorder,
    }

    fn tenant(mode: TenantMode) -> Arc<TenantProfile> {
        Arc::new(TenantProfile {
            id: Uuid::new_v4(),
            slug: "acme".into(),
            display_name: "Acme".into(),
            mode,
            custom_domain: None,
            subdomain: Some("acme".into()),
            auth_methods: BTreeSet::from([AuthMethod::OidcEnterprise]),
            features: BTreeSet::new(),
            branding: Branding::default(),
            tables: vec![],
            departments: vec![
                DepartmentDef {
                    slug: "it".into(),
                    display_name: "IT".into(),
                },
                DepartmentDef {
                    slug: "logistics".into(),
                    display_name: "Logistics".into(),
                },
            ],
            persona: None,
        })
    }

    fn principal(tenant_id: Uuid, depts: &[&str]) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            tenant_id,
            email: "u@acme.com".into(),
            departments: depts.iter().map(|s| s.to_string()).collect(),
            dept_head_for: BTreeSet::new(),
            is_super_user: false,
        }
    }

    fn harness(provider: Arc<dyn LlmProvider>) -> Harness {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let embedder = Embedder::spawn(
            Arc::new(FixedTransport),
            Arc::new(EmbedCache::in_memory(4).unwrap()),
            BatcherSettings {
                batch_size: 8,
                batch_window_ms: 5,
                workers: 1,
                dim: 4,
            },
        );
        let retriever = Arc::new(DualRetriever::new(
            Arc::clone(&storage),
            embedder.clone(),
            RetrievalConfig::default(),
        ));
        let heuristics = Arc::new(HeuristicsEngine::new(Arc::clone(&storage)));
        let (analytics, analytics_worker) = AnalyticsRecorder::spawn(Arc::clone(&storage));
        let (memory, memory_worker) = MemoryPipeline::spawn(
            Arc::clone(&storage),
            embedder.clone(),
            MemoryConfig {
                batch_interval_ms: 60_000,
                max_batch_size: 100,
            },
        );
        let settings = PipelineSettings {
            llm: LlmConfig {
                provider: "scripted".into(),
                model: "test-model".into(),
                api_key: None,
                base_url: None,
                first_token_timeout_ms: 2_000,
                idle_timeout_ms: 2_000,
                max_tokens: 512,
            },
            retrieval_timeout_ms: 2_000,
            max_tool_calls: 4,
            query_text_max: 2_000,
            passage_token_budget: 3_000,
        };
        Harness {
            pipeline: CognitivePipeline::new(
                provider,
                retriever,
                heuristics,
                analytics,
                memory,
                Arc::clone(&storage),
                embedder,
                settings,
            ),
            storage,
            memory_worker,
            analytics_worker,
        }
    }

    fn done_event() -> StreamEvent {
        StreamEvent::Done {
            model: "test-model".into(),
            tokens_in: 12,
            tokens_out: 30,
            stop_reason: "end_turn".into(),
        }
    }

    async fn collect_frames(mut rx: mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    fn joined_tokens(frames: &[ServerFrame]) -> String {
        frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Token { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn happy_path_streams_and_records() {
        let provider = ScriptedProvider::new(vec![vec![
            StreamEvent::TextDelta {
                text: "Hello ".into(),
            },
            StreamEvent::TextDelta {
                text: "there.".into(),
            },
            done_event(),
        ]]);
        let h = harness(provider);
        let t = tenant(TenantMode::Enterprise);
        let p = principal(t.id, &["it"]);
        let tenant_id = t.id;

        let (tx, rx) = mpsc::channel(64);
        h.pipeline
            .handle_query(
                QueryRequest {
                    principal: p,
                    tenant: t,
                    query_text: "How do I reset my password ASAP?".into(),
                    session_id: "s1".into(),
                    department_override: None,
                },
                tx,
                CancellationToken::new(),
            )
            .await;

        let frames = collect_frames(rx).await;
        assert_eq!(joined_tokens(&frames), "Hello there.");
        assert!(matches!(frames.last(), Some(ServerFrame::Done { .. })));

        h.analytics_worker.shutdown().await;
        let records = h
            .storage
            .queries_since(tenant_id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.status, QueryStatus::Completed);
        assert_eq!(record.intent, cortex_core::types::QueryIntent::Action);
        assert_eq!(record.urgency, cortex_core::types::Urgency::Urgent);
        assert_eq!(record.inferred_department, "it");
        assert_eq!(record.query_position_in_session, 1);
        assert_eq!(record.tokens_out, 30);
        h.memory_worker.shutdown().await;
    }

    #[tokio::test]
    async fn fail_secure_empty_access_still_answers() {
        let provider = ScriptedProvider::new(vec![vec![
            StreamEvent::TextDelta {
                text: "I don't have return-process documents, but generally...".into(),
            },
            done_event(),
        ]]);
        let h = harness(provider);
        let t = tenant(TenantMode::Enterprise);
        let p = principal(t.id, &[]);
        let tenant_id = t.id;

        // Content exists, but the principal has no department access.
        h.storage
            .insert_chunks(&[DocumentChunk {
                id: Uuid::new_v4(),
                tenant_id,
                department_id: "logistics".into(),
                source_file: "handbook.md".into(),
                file_hash: "aa".into(),
                section_title: "Returns".into(),
                content: "How to process returns".into(),
                chunk_index: 0,
                parent_document_id: None,
                token_count: 20,
                keywords: vec!["returns".into()],
                category: None,
                subcategory: None,
                embedding: Some(vec![1.0, 0.0, 0.0, 0.0]),
                enrichment: None,
                created_at: Utc::now(),
            }])
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(64);
        h.pipeline
            .handle_query(
                QueryRequest {
                    principal: p,
                    tenant: t,
                    query_text: "How do I process returns?".into(),
                    session_id: "s1".into(),
                    department_override: None,
                },
                tx,
                CancellationToken::new(),
            )
            .await;

        let frames = collect_frames(rx).await;
        // zero passages cited, but a real reply still streamed
        let citation_count = frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Citation { passages } => Some(passages.len()),
                _ => None,
            })
            .next()
            .unwrap();
        assert_eq!(citation_count, 0);
        assert!(!joined_tokens(&frames).is_empty());

        h.analytics_worker.shutdown().await;
        let records = h
            .storage
            .queries_since(tenant_id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(records[0].category, "how_to");
        assert_eq!(records[0].inferred_department, "logistics");
        h.memory_worker.shutdown().await;
    }

    #[tokio::test]
    async fn tool_tag_is_suppressed_and_reinjected() {
        let provider = ScriptedProvider::new(vec![
            vec![
                StreamEvent::TextDelta {
                    text: "Checking the terms ".into(),
                },
                StreamEvent::TextDelta {
                    text: "[GREP term=\"vendor terms\"]".into(),
                },
            ],
            vec![
                StreamEvent::TextDelta {
                    text: "here is what I found.".into(),
                },
                done_event(),
            ],
        ]);
        let provider_ref = Arc::clone(&provider);
        let h = harness(provider);
        let t = tenant(TenantMode::Enterprise);
        let p = principal(t.id, &["logistics"]);
        let tenant_id = t.id;

        h.storage
            .insert_chunks(&[DocumentChunk {
                id: Uuid::new_v4(),
                tenant_id,
                department_id: "logistics".into(),
                source_file: "vendors.md".into(),
                file_hash: "bb".into(),
                section_title: "Vendor terms".into(),
                content: "Net 30 vendor terms apply to all shipments".into(),
                chunk_index: 0,
                parent_document_id: None,
                token_count: 20,
                keywords: vec!["vendor".into(), "terms".into()],
                category: None,
                subcategory: None,
                embedding: Some(vec![1.0, 0.0, 0.0, 0.0]),
                enrichment: None,
                created_at: Utc::now(),
            }])
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(64);
        h.pipeline
            .handle_query(
                QueryRequest {
                    principal: p,
                    tenant: t,
                    query_text: "what are the vendor terms?".into(),
                    session_id: "s1".into(),
                    department_override: None,
                },
                tx,
                CancellationToken::new(),
            )
            .await;

        let frames = collect_frames(rx).await;
        let streamed = joined_tokens(&frames);
        assert!(streamed.contains("Checking the terms"));
        assert!(streamed.contains("here is what I found."));
        // the literal tag never reaches the client
        assert!(!streamed.contains("[GREP"));

        // the second completion round saw the tool result
        let requests = provider_ref.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let reinjected = requests[1]
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("Net 30 vendor terms"));
        assert!(reinjected, "tool result must be re-injected as a system turn");

        h.analytics_worker.shutdown().await;
        h.memory_worker.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_records_partial_and_skips_memory() {
        let provider = Arc::new(ScriptedProvider {
            rounds: Mutex::new(vec![vec![StreamEvent::TextDelta {
                text: "partial answer that keeps going".into(),
            }]]),
            requests: Mutex::new(Vec::new()),
            hang_after: true,
        });
        let h = harness(provider);
        let t = tenant(TenantMode::Consumer);
        let p = principal(t.id, &["it"]);
        let tenant_id = t.id;
        let user_id = p.user_id;

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);

        let canceler = cancel.clone();
        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = rx.recv().await {
                let is_token = matches!(frame, ServerFrame::Token { .. });
                seen.push(frame);
                if is_token {
                    canceler.cancel();
                }
            }
            seen
        });

        h.pipeline
            .handle_query(
                QueryRequest {
                    principal: p,
                    tenant: t,
                    query_text: "tell me everything".into(),
                    session_id: "s1".into(),
                    department_override: None,
                },
                tx,
                cancel,
            )
            .await;

        let frames = watcher.await.unwrap();
        assert!(!joined_tokens(&frames).is_empty());
        assert!(!frames.iter().any(|f| matches!(f, ServerFrame::Done { .. })));

        h.analytics_worker.shutdown().await;
        h.memory_worker.shutdown().await;

        let records = h
            .storage
            .queries_since(tenant_id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, QueryStatus::Canceled);
        assert!(records[0].response_length > 0);

        // no memory node for the canceled exchange
        let scope = Scope::User { user_id };
        assert!(h.storage.get_nodes(&scope, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_down_reports_failed() {
        // No events at all: channel closes, provider returns Ok but the
        // stream never produced a Done/typed error → treated as failure.
        struct DeadProvider;
        #[async_trait]
        impl LlmProvider for DeadProvider {
            fn name(&self) -> &str {
                "dead"
            }
            async fn send(
                &self,
                _req: &ChatRequest,
            ) -> Result<crate::provider::ChatResponse, crate::provider::ProviderError> {
                Err(crate::provider::ProviderError::Unavailable("down".into()))
            }
            async fn send_stream(
                &self,
                _req: &ChatRequest,
                _tx: mpsc::Sender<StreamEvent>,
            ) -> Result<(), crate::provider::ProviderError> {
                Err(crate::provider::ProviderError::Unavailable("down".into()))
            }
        }

        let h = harness(Arc::new(DeadProvider));
        let t = tenant(TenantMode::Enterprise);
        let p = principal(t.id, &["it"]);
        let tenant_id = t.id;

        let (tx, rx) = mpsc::channel(64);
        h.pipeline
            .handle_query(
                QueryRequest {
                    principal: p,
                    tenant: t,
                    query_text: "hello?".into(),
                    session_id: "s1".into(),
                    department_override: None,
                },
                tx,
                CancellationToken::new(),
            )
            .await;

        let frames = collect_frames(rx).await;
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::Error { code, .. } if code == "PROVIDER_UNAVAILABLE"
        )));

        h.analytics_worker.shutdown().await;
        let records = h
            .storage
            .queries_since(tenant_id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(records[0].status, QueryStatus::Failed);
        h.memory_worker.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_department_override_is_forbidden() {
        let provider = ScriptedProvider::new(vec![vec![done_event()]]);
        let h = harness(provider);
        let t = tenant(TenantMode::Enterprise);
        let p = principal(t.id, &["it"]);

        let (tx, rx) = mpsc::channel(64);
        h.pipeline
            .handle_query(
                QueryRequest {
                    principal: p,
                    tenant: t,
                    query_text: "hi".into(),
                    session_id: "s1".into(),
                    department_override: Some("finance".into()),
                },
                tx,
                CancellationToken::new(),
            )
            .await;

        let frames = collect_frames(rx).await;
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::Error { code, .. } if code == "FORBIDDEN"
        )));
        h.analytics_worker.shutdown().await;
        h.memory_worker.shutdown().await;
    }

    #[tokio::test]
    async fn session_position_increases() {
        let rounds: Vec<Vec<StreamEvent>> = (0..2)
            .map(|_| {
                vec![
                    StreamEvent::TextDelta { text: "ok".into() },
                    done_event(),
                ]
            })
            .collect();
        let provider = ScriptedProvider::new(rounds);
        let h = harness(provider);
        let t = tenant(TenantMode::Enterprise);
        let p = principal(t.id, &["it"]);
        let tenant_id = t.id;

        for _ in 0..2 {
            let (tx, rx) = mpsc::channel(64);
            h.pipeline
                .handle_query(
                    QueryRequest {
                        principal: p.clone(),
                        tenant: Arc::clone(&t),
                        query_text: "how do I reset my password".into(),
                        session_id: "s1".into(),
                        department_override: None,
                    },
                    tx,
                    CancellationToken::new(),
                )
                .await;
            collect_frames(rx).await;
            // queries land via the analytics worker; give it a beat so the
            // next RESOLVE sees this record
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        h.analytics_worker.shutdown().await;
        let mut records = h
            .storage
            .queries_since(tenant_id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        records.sort_by_key(|r| r.query_position_in_session);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].query_position_in_session, 1);
        assert_eq!(records[1].query_position_in_session, 2);
        assert!(records[1].is_repeat);
        assert_eq!(records[1].repeat_of, Some(records[0].id));
        h.memory_worker.shutdown().await;
    }
}
