//! Batching front-end for the embedding transport.
//!
//! Callers submit texts and wait on per-text futures; a background task
//! groups misses into batches bounded by size and a latency window, then
//! hands each batch to a bounded worker pool. A caller dropping its future
//! abandons the wait but never aborts the in-flight batch — the result
//! still lands in the cache.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use crate::cache::EmbedCache;
use crate::client::EmbedTransport;
use crate::error::{EmbedError, Result};

struct Pending {
    text: String,
    reply: oneshot::Sender<Result<Vec<f32>>>,
}

/// Cheaply cloneable handle. `embed` resolves each text from the cache
/// when possible and otherwise waits for the batcher.
#[derive(Clone)]
pub struct Embedder {
    tx: mpsc::Sender<Pending>,
    cache: Arc<EmbedCache>,
    dim: usize,
}

pub struct BatcherSettings {
    pub batch_size: usize,
    pub batch_window_ms: u64,
    pub workers: usize,
    pub dim: usize,
}

impl Embedder {
    /// Spawn the batching task and return the caller handle.
    pub fn spawn(
        transport: Arc<dyn EmbedTransport>,
        cache: Arc<EmbedCache>,
        settings: BatcherSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Pending>(1024);
        let dim = settings.dim;
        tokio::spawn(run_batcher(
            rx,
            transport,
            Arc::clone(&cache),
            settings,
        ));
        Self { tx, cache, dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Embed a slice of texts, preserving order. Cache hits return without
    /// any network I/O; misses wait for their batch.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut waiting: Vec<(usize, oneshot::Receiver<Result<Vec<f32>>>)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if let Some(hit) = self.cache.get(text) {
                out[i] = Some(hit);
                continue;
            }
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(Pending {
                    text: text.clone(),
                    reply,
                })
                .await
                .map_err(|_| EmbedError::Closed)?;
            waiting.push((i, rx));
        }

        for (i, rx) in waiting {
            let vector = rx.await.map_err(|_| EmbedError::Closed)??;
            out[i] = Some(vector);
        }
        Ok(out.into_iter().map(|v| v.expect("all slots filled")).collect())
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        Ok(vectors.remove(0))
    }
}

async fn run_batcher(
    mut rx: mpsc::Receiver<Pending>,
    transport: Arc<dyn EmbedTransport>,
    cache: Arc<EmbedCache>,
    settings: BatcherSettings,
) {
    let window = std::time::Duration::from_millis(settings.batch_window_ms);
    let pool = Arc::new(Semaphore::new(settings.workers.max(1)));

    loop {
        // Block for the first pending text of the next batch.
        let Some(first) = rx.recv().await else {
            debug!("embed batcher channel closed");
            return;
        };
        let mut batch = vec![first];

        // Fill the batch until the size cap or the window elapses.
        let deadline = tokio::time::Instant::now() + window;
        while batch.len() < settings.batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(pending)) => batch.push(pending),
                Ok(None) | Err(_) => break,
            }
        }

        let permit = Arc::clone(&pool).acquire_owned().await;
        let Ok(permit) = permit else { return };
        let transport = Arc::clone(&transport);
        let cache = Arc::clone(&cache);
        let dim = settings.dim;

        tokio::spawn(async move {
            let _permit = permit;
            dispatch_batch(batch, transport, cache, dim).await;
        });
    }
}

async fn dispatch_batch(
    batch: Vec<Pending>,
    transport: Arc<dyn EmbedTransport>,
    cache: Arc<EmbedCache>,
    dim: usize,
) {
    let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
    debug!(size = texts.len(), "dispatching embed batch");

    match transport.embed_batch(&texts).await {
        Ok(vectors) => {
            for (pending, vector) in batch.into_iter().zip(vectors) {
                if vector.len() != dim {
                    let _ = pending.reply.send(Err(EmbedError::DimensionMismatch {
                        got: vector.len(),
                        expected: dim,
                    }));
                    continue;
                }
                cache.put(&pending.text, &vector);
                // Receiver may have been dropped (caller canceled) — fine.
                let _ = pending.reply.send(Ok(vector));
            }
        }
        Err(e) => {
            warn!(error = %e, size = texts.len(), "embed batch failed, failing waiters");
            for pending in batch {
                let _ = pending.reply.send(Err(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        calls: AtomicUsize,
        texts_seen: std::sync::Mutex<Vec<usize>>,
        fail: bool,
    }

    impl CountingTransport {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                texts_seen: std::sync::Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl EmbedTransport for CountingTransport {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_seen.lock().unwrap().push(texts.len());
            if self.fail {
                return Err(EmbedError::Unavailable("down".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn settings() -> BatcherSettings {
        BatcherSettings {
            batch_size: 8,
            batch_window_ms: 10,
            workers: 2,
            dim: 2,
        }
    }

    #[tokio::test]
    async fn second_embed_of_same_text_hits_cache() {
        let transport = CountingTransport::new(false);
        let cache = Arc::new(EmbedCache::in_memory(2).unwrap());
        let embedder = Embedder::spawn(transport.clone(), cache, settings());

        let texts = vec!["hello world".to_string()];
        embedder.embed(&texts).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        // identical call: zero network I/O
        embedder.embed(&texts).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn misses_are_batched_together() {
        let transport = CountingTransport::new(false);
        let cache = Arc::new(EmbedCache::in_memory(2).unwrap());
        let embedder = Embedder::spawn(transport.clone(), cache, settings());

        let texts: Vec<String> = (0..5).map(|i| format!("text {}", i)).collect();
        let vectors = embedder.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);

        // All five landed in one upstream call.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*transport.texts_seen.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn upstream_failure_fails_all_waiters() {
        let transport = CountingTransport::new(true);
        let cache = Arc::new(EmbedCache::in_memory(2).unwrap());
        let embedder = Embedder::spawn(transport, cache, settings());

        let err = embedder
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::Unavailable(_)));
    }

    #[tokio::test]
    async fn order_is_preserved_across_hits_and_misses() {
        let transport = CountingTransport::new(false);
        let cache = Arc::new(EmbedCache::in_memory(2).unwrap());
        cache.put("cached", &[9.0, 9.0]);
        let embedder = Embedder::spawn(transport, cache, settings());

        let vectors = embedder
            .embed(&["cached".to_string(), "fresh".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors[0], vec![9.0, 9.0]);
        assert_eq!(vectors[1], vec![1.0, 0.0]);
    }
}
