//! Memory pipeline.
//!
//! Completed exchanges are buffered and flushed as a batch — on an
//! interval, when the buffer fills, or on shutdown. Each batch is
//! embedded in one call, then inserted node by node (idempotent by id).
//! Enqueueing is best-effort and never blocks the response path; the
//! channel preserves FIFO order through to the flush.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use cortex_core::config::MemoryConfig;
use cortex_core::types::{MemoryNode, MemorySource};
use cortex_embedder::Embedder;
use cortex_storage::StorageBackend;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const CHANNEL_CAP: usize = 512;
/// Recent assistant outputs kept per session for pipeline context.
const RECENT_PER_SESSION: usize = 3;

/// One finished human/assistant exchange, scope already assigned by the
/// cognitive pipeline (user for consumer tenants, tenant for enterprise).
#[derive(Debug, Clone)]
pub struct CompletedExchange {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub conversation_id: Uuid,
    pub sequence_index: u32,
    pub human: String,
    pub assistant: String,
    pub source: MemorySource,
    pub tags: Vec<String>,
}

#[derive(Clone)]
pub struct MemoryHandle {
    tx: mpsc::Sender<CompletedExchange>,
    recent: Arc<DashMap<String, VecDeque<String>>>,
    conversations: Arc<DashMap<String, Uuid>>,
}

impl MemoryHandle {
    /// Best-effort enqueue. A full buffer drops the exchange (with a
    /// warning) rather than blocking or reordering the FIFO.
    pub fn enqueue(&self, exchange: CompletedExchange) {
        if let Err(e) = self.tx.try_send(exchange) {
            warn!(error = %e, "memory pipeline full, exchange dropped");
        }
    }

    /// Remember an assistant reply for quick same-session lookup.
    pub fn note_session_output(&self, session_id: &str, output: &str) {
        let mut entry = self.recent.entry(session_id.to_string()).or_default();
        if entry.len() >= RECENT_PER_SESSION {
            entry.pop_front();
        }
        entry.push_back(output.to_string());
    }

    /// Most recent assistant outputs for a session, oldest first.
    pub fn recent_session_outputs(&self, session_id: &str) -> Vec<String> {
        self.recent
            .get(session_id)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stable conversation id for a session, minted on first use.
    pub fn conversation_for(&self, session_id: &str) -> Uuid {
        *self
            .conversations
            .entry(session_id.to_string())
            .or_insert_with(Uuid::new_v4)
    }
}

pub struct MemoryPipeline {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl MemoryPipeline {
    pub fn spawn(
        storage: Arc<dyn StorageBackend>,
        embedder: Embedder,
        config: MemoryConfig,
    ) -> (MemoryHandle, MemoryPipeline) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAP);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run(storage, embedder, config, rx, cancel.clone()));
        (
            MemoryHandle {
                tx,
                recent: Arc::new(DashMap::new()),
                conversations: Arc::new(DashMap::new()),
            },
            MemoryPipeline { cancel, join },
        )
    }

    /// Force a final flush and stop the worker (clean shutdown).
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

async fn run(
    storage: Arc<dyn StorageBackend>,
    embedder: Embedder,
    config: MemoryConfig,
    mut rx: mpsc::Receiver<CompletedExchange>,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<CompletedExchange> = Vec::new();
    let mut tick =
        tokio::time::interval(std::time::Duration::from_millis(config.batch_interval_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            exchange = rx.recv() => {
                match exchange {
                    Some(exchange) => {
                        buffer.push(exchange);
                        if buffer.len() >= config.max_batch_size {
                            flush(&storage, &embedder, &mut buffer).await;
                        }
                    }
                    None => break,
                }
            }

            _ = tick.tick() => {
                if !buffer.is_empty() {
                    flush(&storage, &embedder, &mut buffer).await;
                }
            }

            _ = cancel.cancelled() => break,
        }
    }

    // Drain whatever arrived before shutdown and flush once more.
    while let Ok(exchange) = rx.try_recv() {
        buffer.push(exchange);
    }
    if !buffer.is_empty() {
        flush(&storage, &embedder, &mut buffer).await;
    }
    debug!("memory pipeline stopped");
}

/// Embed the whole batch in one call, then insert in enqueue order. An
/// embedder outage downgrades to embedding-less nodes rather than losing
/// the exchange.
async fn flush(
    storage: &Arc<dyn StorageBackend>,
    embedder: &Embedder,
    buffer: &mut Vec<CompletedExchange>,
) {
    let batch: Vec<CompletedExchange> = std::mem::take(buffer);
    let texts: Vec<String> = batch
        .iter()
        .map(|ex| format!("{}\n{}", ex.human, ex.assistant))
        .collect();

    let embeddings: Vec<Option<Vec<f32>>> = match embedder.embed(&texts).await {
        Ok(vectors) => vectors.into_iter().map(Some).collect(),
        Err(e) => {
            warn!(error = %e, size = batch.len(), "batch embed failed, storing without vectors");
            vec![None; batch.len()]
        }
    };

    for (exchange, embedding) in batch.into_iter().zip(embeddings) {
        let node = MemoryNode {
            id: exchange.id,
            user_id: exchange.user_id,
            tenant_id: exchange.tenant_id,
            conversation_id: exchange.conversation_id,
            sequence_index: exchange.sequence_index,
            human_content: exchange.human,
            assistant_content: exchange.assistant,
            source: exchange.source,
            embedding,
            tags: exchange.tags,
            created_at: Utc::now(),
        };
        if let Err(e) = storage.insert_node(&node).await {
            warn!(node_id = %node.id, error = %e, "memory node insert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cortex_core::types::Scope;
    use cortex_embedder::{
        batcher::BatcherSettings, cache::EmbedCache, EmbedError, EmbedTransport,
    };
    use cortex_storage::SqlBackend;

    struct FixedTransport;

    #[async_trait]
    impl EmbedTransport for FixedTransport {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    fn embedder() -> Embedder {
        Embedder::spawn(
            Arc::new(FixedTransport),
            Arc::new(EmbedCache::in_memory(4).unwrap()),
            BatcherSettings {
                batch_size: 16,
                batch_window_ms: 5,
                workers: 1,
                dim: 4,
            },
        )
    }

    fn exchange(user: Uuid, seq: u32) -> CompletedExchange {
        CompletedExchange {
            id: Uuid::new_v4(),
            user_id: Some(user),
            tenant_id: None,
            conversation_id: Uuid::new_v4(),
            sequence_index: seq,
            human: format!("question {}", seq),
            assistant: format!("answer {}", seq),
            source: MemorySource::Chat,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn shutdown_forces_a_flush() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let config = MemoryConfig {
            batch_interval_ms: 60_000, // far away; only shutdown can flush
            max_batch_size: 100,
        };
        let (handle, pipeline) = MemoryPipeline::spawn(Arc::clone(&storage), embedder(), config);

        let user = Uuid::new_v4();
        for seq in 0..3 {
            handle.enqueue(exchange(user, seq));
        }
        pipeline.shutdown().await;

        let scope = Scope::User { user_id: user };
        let nodes = storage.get_nodes(&scope, 10, 0).await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|n| n.embedding.is_some()));
    }

    #[tokio::test]
    async fn size_cap_triggers_early_flush() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let config = MemoryConfig {
            batch_interval_ms: 60_000,
            max_batch_size: 2,
        };
        let (handle, pipeline) = MemoryPipeline::spawn(Arc::clone(&storage), embedder(), config);

        let user = Uuid::new_v4();
        handle.enqueue(exchange(user, 0));
        handle.enqueue(exchange(user, 1));

        // Give the worker a moment; the flush must happen before shutdown.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let scope = Scope::User { user_id: user };
        assert_eq!(storage.get_nodes(&scope, 10, 0).await.unwrap().len(), 2);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn recent_session_outputs_are_capped_and_ordered() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqlBackend::in_memory(4).unwrap());
        let (handle, pipeline) =
            MemoryPipeline::spawn(storage, embedder(), MemoryConfig::default());

        for i in 0..5 {
            handle.note_session_output("s1", &format!("reply {}", i));
        }
        let recent = handle.recent_session_outputs("s1");
        assert_eq!(recent, vec!["reply 2", "reply 3", "reply 4"]);
        assert!(handle.recent_session_outputs("s2").is_empty());
        pipeline.shutdown().await;
    }
}
