use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EmbedError, Result};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;

/// Transport to the external embedding service. A trait so the batcher
/// can be exercised without a network in tests.
#[async_trait]
pub trait EmbedTransport: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP transport with bounded retry: exponential backoff plus jitter so
/// synchronized callers don't stampede a recovering service.
pub struct HttpEmbedTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpEmbedTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout_ms: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }

    async fn attempt(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let mut req = self.http.post(&url).json(&EmbedRequest { input: texts });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EmbedError::Unavailable(format!(
                "embedding service returned {}",
                resp.status()
            )));
        }
        let body: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
        if body.embeddings.len() != texts.len() {
            return Err(EmbedError::Unavailable(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                body.embeddings.len()
            )));
        }
        Ok(body.embeddings)
    }
}

#[async_trait]
impl EmbedTransport for HttpEmbedTransport {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = EmbedError::Unavailable("no attempt made".into());
        for attempt in 0..MAX_ATTEMPTS {
            match self.attempt(texts).await {
                Ok(vectors) => {
                    if attempt > 0 {
                        info!(attempt, "embed batch succeeded after retry");
                    }
                    return Ok(vectors);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "embed batch failed");
                    last_err = e;
                    if attempt + 1 < MAX_ATTEMPTS {
                        let backoff = BACKOFF_BASE_MS << attempt;
                        let jitter = rand::thread_rng().gen_range(0..BACKOFF_BASE_MS);
                        tokio::time::sleep(std::time::Duration::from_millis(backoff + jitter))
                            .await;
                    }
                }
            }
        }
        Err(last_err)
    }
}
