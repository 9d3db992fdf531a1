use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Process exit codes (sysexits-style, checked by the init system).
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_INVALID: i32 = 64;
pub const EXIT_BACKEND_UNAVAILABLE: i32 = 69;
pub const EXIT_FATAL: i32 = 70;

pub const DEFAULT_PORT: u16 = 18920;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Hard cap per inbound chat frame.
pub const MAX_FRAME_BYTES: usize = 128 * 1024;
/// Token frames are coalesced for at most this long before flushing.
pub const COALESCE_WINDOW_MS: u64 = 25;

/// Top-level config (cortex.toml + CORTEX_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CortexConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    pub auth: AuthSettings,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub tenants: TenantsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    File,
    Sql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend_kind")]
    pub backend: StorageBackendKind,
    /// For `sql`: directory holding the SQLite files. For `file`: the
    /// JSONL data directory.
    #[serde(default = "default_dsn")]
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend_kind(),
            dsn: default_dsn(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Base URL of the external embedding service.
    #[serde(default = "default_embedder_url")]
    pub provider: String,
    pub api_key: Option<String>,
    #[serde(default = "default_embed_dim")]
    pub dim: usize,
    #[serde(default = "default_embed_batch")]
    pub batch_size: usize,
    #[serde(default = "default_embed_window")]
    pub batch_window_ms: u64,
    #[serde(default = "default_embed_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_embed_workers")]
    pub workers: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: default_embedder_url(),
            api_key: None,
            dim: default_embed_dim(),
            batch_size: default_embed_batch(),
            batch_window_ms: default_embed_window(),
            timeout_ms: default_embed_timeout(),
            workers: default_embed_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "anthropic" or an OpenAI-compatible provider id.
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_first_token_timeout")]
    pub first_token_timeout_ms: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalWeights {
    #[serde(default = "default_w_content")]
    pub content: f32,
    #[serde(default = "default_w_questions")]
    pub questions: f32,
    #[serde(default = "default_w_type")]
    pub type_bonus: f32,
    #[serde(default = "default_w_entity")]
    pub entity_bonus: f32,
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            content: default_w_content(),
            questions: default_w_questions(),
            type_bonus: default_w_type(),
            entity_bonus: default_w_entity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default)]
    pub weights: RetrievalWeights,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_ms: u64,
    /// How many of the top passages get prerequisite expansion.
    #[serde(default = "default_expand_top")]
    pub expand_top: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            weights: RetrievalWeights::default(),
            timeout_ms: default_retrieval_timeout(),
            expand_top: default_expand_top(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_interval")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_memory_batch")]
    pub max_batch_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_memory_interval(),
            max_batch_size: default_memory_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Reserved hostname that always resolves to the consumer profile.
    pub consumer_host: String,
    /// Base URL of the enterprise IdP (token introspection endpoint).
    pub enterprise_base: String,
    /// HMAC key for consumer session tokens.
    pub session_secret: String,
    /// Auto-create users on first successful authentication.
    #[serde(default = "bool_true")]
    pub auto_provision: bool,
    /// User cache TTL.
    #[serde(default = "default_user_ttl")]
    pub user_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeaturesConfig {
    #[serde(default)]
    pub extraction_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_user_rpm")]
    pub per_user_rpm: u32,
    #[serde(default = "default_ip_rpm")]
    pub per_ip_rpm: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_user_rpm: default_user_rpm(),
            per_ip_rpm: default_ip_rpm(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    /// Query text longer than this is truncated in analytics records only.
    #[serde(default = "default_query_text_max")]
    pub query_text_max: usize,
    /// Passage budget for prompt assembly, in approximate tokens.
    #[serde(default = "default_passage_budget")]
    pub passage_token_budget: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            query_text_max: default_query_text_max(),
            passage_token_budget: default_passage_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantsConfig {
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,
}

impl Default for TenantsConfig {
    fn default() -> Self {
        Self {
            catalog_path: default_catalog_path(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_backend_kind() -> StorageBackendKind {
    StorageBackendKind::Sql
}
fn default_dsn() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cortex/data", home)
}
fn default_embedder_url() -> String {
    "http://localhost:8091".to_string()
}
fn default_embed_dim() -> usize {
    1024
}
fn default_embed_batch() -> usize {
    32
}
fn default_embed_window() -> u64 {
    50
}
fn default_embed_timeout() -> u64 {
    5_000
}
fn default_embed_workers() -> usize {
    4
}
fn default_first_token_timeout() -> u64 {
    10_000
}
fn default_idle_timeout() -> u64 {
    30_000
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_w_content() -> f32 {
    0.30
}
fn default_w_questions() -> f32 {
    0.50
}
fn default_w_type() -> f32 {
    0.10
}
fn default_w_entity() -> f32 {
    0.10
}
fn default_top_k() -> usize {
    20
}
fn default_min_score() -> f32 {
    0.6
}
fn default_retrieval_timeout() -> u64 {
    2_000
}
fn default_expand_top() -> usize {
    5
}
fn default_memory_interval() -> u64 {
    5_000
}
fn default_memory_batch() -> usize {
    10
}
fn default_user_ttl() -> u64 {
    30
}
fn default_user_rpm() -> u32 {
    60
}
fn default_ip_rpm() -> u32 {
    120
}
fn default_max_tool_calls() -> usize {
    4
}
fn default_query_text_max() -> usize {
    2_000
}
fn default_passage_budget() -> usize {
    3_000
}
fn default_catalog_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cortex/tenants.toml", home)
}

impl CortexConfig {
    /// Load config from a TOML file with CORTEX_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CortexConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CORTEX_").split("_"))
            .extract()
            .map_err(|e| crate::error::CortexError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would only fail at request time.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.embedder.dim == 0 {
            return Err(crate::error::CortexError::Config(
                "embedder.dim must be positive".into(),
            ));
        }
        if self.embedder.batch_size == 0 {
            return Err(crate::error::CortexError::Config(
                "embedder.batch_size must be positive".into(),
            ));
        }
        let w = &self.retrieval.weights;
        if w.content < 0.0 || w.questions < 0.0 || w.type_bonus < 0.0 || w.entity_bonus < 0.0 {
            return Err(crate::error::CortexError::Config(
                "retrieval.weights must be non-negative".into(),
            ));
        }
        if w.content + w.questions == 0.0 {
            return Err(crate::error::CortexError::Config(
                "retrieval.weights.content and .questions cannot both be zero".into(),
            ));
        }
        if self.memory.max_batch_size == 0 {
            return Err(crate::error::CortexError::Config(
                "memory.max_batch_size must be positive".into(),
            ));
        }
        if self.auth.session_secret.len() < 16 {
            return Err(crate::error::CortexError::Config(
                "auth.session_secret must be at least 16 bytes".into(),
            ));
        }
        match self.llm.provider.as_str() {
            "anthropic" => {}
            other if !other.is_empty() => {}
            _ => {
                return Err(crate::error::CortexError::Config(
                    "llm.provider must be set".into(),
                ))
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cortex/cortex.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> CortexConfig {
        CortexConfig {
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
            embedder: EmbedderConfig::default(),
            llm: LlmConfig {
                provider: "anthropic".into(),
                model: "claude-sonnet-4-6".into(),
                api_key: Some("k".into()),
                base_url: None,
                first_token_timeout_ms: default_first_token_timeout(),
                idle_timeout_ms: default_idle_timeout(),
                max_tokens: default_max_tokens(),
            },
            retrieval: RetrievalConfig::default(),
            memory: MemoryConfig::default(),
            auth: AuthSettings {
                consumer_host: "chat.example.com".into(),
                enterprise_base: "https://idp.example.com".into(),
                session_secret: "0123456789abcdef".into(),
                auto_provision: true,
                user_cache_ttl_secs: 30,
            },
            features: FeaturesConfig::default(),
            rate_limit: RateLimitConfig::default(),
            pipeline: PipelineConfig::default(),
            tenants: TenantsConfig::default(),
        }
    }

    #[test]
    fn defaults_validate() {
        minimal().validate().unwrap();
    }

    #[test]
    fn zero_dim_rejected() {
        let mut cfg = minimal();
        cfg.embedder.dim = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn short_session_secret_rejected() {
        let mut cfg = minimal();
        cfg.auth.session_secret = "short".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_fusion_weights() {
        let w = RetrievalWeights::default();
        assert!((w.content - 0.30).abs() < f32::EPSILON);
        assert!((w.questions - 0.50).abs() < f32::EPSILON);
        assert!((w.type_bonus - 0.10).abs() < f32::EPSILON);
        assert!((w.entity_bonus - 0.10).abs() < f32::EPSILON);
    }
}
