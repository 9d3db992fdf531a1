use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use cortex_agent::pipeline::PipelineSettings;
use cortex_agent::CognitivePipeline;
use cortex_analytics::{AnalyticsRecorder, AnalyticsReports};
use cortex_core::config::{
    CortexConfig, StorageBackendKind, EXIT_BACKEND_UNAVAILABLE, EXIT_CONFIG_INVALID, EXIT_FATAL,
    EXIT_OK,
};
use cortex_embedder::batcher::BatcherSettings;
use cortex_embedder::{EmbedCache, Embedder, HttpEmbedTransport};
use cortex_heuristics::HeuristicsEngine;
use cortex_identity::{Authenticator, UserStore};
use cortex_memory::MemoryPipeline;
use cortex_retrieval::DualRetriever;
use cortex_storage::{FileBackend, SqlBackend, StorageBackend};
use cortex_tenants::{TenantCatalog, TenantResolver};

mod app;
mod http;
mod ratelimit;
mod ws;

#[derive(Debug, Parser)]
#[command(name = "cortex-gateway", about = "Multi-tenant cognitive chat gateway")]
struct Cli {
    /// Path to cortex.toml (default: ~/.cortex/cortex.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cortex_gateway=info,cortex_agent=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

/// Composition root. Every component is constructed here, once, from the
/// immutable config; dependencies flow through constructors only.
async fn run(cli: Cli) -> i32 {
    let config = match CortexConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return EXIT_CONFIG_INVALID;
        }
    };

    let catalog = match TenantCatalog::load(&config.tenants.catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!(error = %e, "tenant catalog failed to load");
            return EXIT_CONFIG_INVALID;
        }
    };
    let tenants = TenantResolver::new(catalog, config.auth.consumer_host.clone());

    let data_dir = Path::new(&config.storage.dsn);
    let storage: Arc<dyn StorageBackend> = match config.storage.backend {
        StorageBackendKind::Sql => match SqlBackend::open(data_dir, config.embedder.dim) {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                error!(error = %e, "sql backend failed to open");
                return EXIT_BACKEND_UNAVAILABLE;
            }
        },
        StorageBackendKind::File => match FileBackend::open(data_dir, config.embedder.dim) {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                error!(error = %e, "file backend failed to open");
                return EXIT_BACKEND_UNAVAILABLE;
            }
        },
    };
    if let Err(e) = storage.verify().await {
        error!(error = %e, "storage backend failed verification");
        return EXIT_BACKEND_UNAVAILABLE;
    }

    let users_conn = match rusqlite::Connection::open(data_dir.join("users.db")) {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "users database failed to open");
            return EXIT_BACKEND_UNAVAILABLE;
        }
    };
    let users = match UserStore::new(users_conn) {
        Ok(store) => Arc::new(
            store.with_ttl(std::time::Duration::from_secs(config.auth.user_cache_ttl_secs)),
        ),
        Err(e) => {
            error!(error = %e, "users schema init failed");
            return EXIT_BACKEND_UNAVAILABLE;
        }
    };
    let auth = Authenticator::new(
        Arc::clone(&users),
        config.auth.enterprise_base.clone(),
        config.auth.session_secret.clone(),
        config.auth.auto_provision,
    );

    let embed_cache = match EmbedCache::open(&data_dir.join("embed_cache.db"), config.embedder.dim)
    {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            error!(error = %e, "embed cache failed to open");
            return EXIT_BACKEND_UNAVAILABLE;
        }
    };
    let embedder = Embedder::spawn(
        Arc::new(HttpEmbedTransport::new(
            config.embedder.provider.clone(),
            config.embedder.api_key.clone(),
            config.embedder.timeout_ms,
        )),
        embed_cache,
        BatcherSettings {
            batch_size: config.embedder.batch_size,
            batch_window_ms: config.embedder.batch_window_ms,
            workers: config.embedder.workers,
            dim: config.embedder.dim,
        },
    );

    let retriever = Arc::new(DualRetriever::new(
        Arc::clone(&storage),
        embedder.clone(),
        config.retrieval.clone(),
    ));
    let heuristics = Arc::new(HeuristicsEngine::new(Arc::clone(&storage)));
    let (analytics, analytics_worker) = AnalyticsRecorder::spawn(Arc::clone(&storage));
    let (memory, memory_worker) =
        MemoryPipeline::spawn(Arc::clone(&storage), embedder.clone(), config.memory.clone());

    let provider: Arc<dyn cortex_agent::LlmProvider> = match config.llm.provider.as_str() {
        "anthropic" => Arc::new(cortex_agent::anthropic::AnthropicProvider::new(
            config.llm.api_key.clone().unwrap_or_default(),
            config.llm.base_url.clone(),
        )),
        other => Arc::new(cortex_agent::openai::OpenAiProvider::new(
            other.to_string(),
            config.llm.api_key.clone().unwrap_or_default(),
            config.llm.base_url.clone(),
        )),
    };

    let pipeline = CognitivePipeline::new(
        provider,
        retriever,
        heuristics,
        analytics.clone(),
        memory.clone(),
        Arc::clone(&storage),
        embedder,
        PipelineSettings {
            llm: config.llm.clone(),
            retrieval_timeout_ms: config.retrieval.timeout_ms,
            max_tool_calls: config.pipeline.max_tool_calls,
            query_text_max: config.pipeline.query_text_max,
            passage_token_budget: config.pipeline.passage_token_budget,
        },
    );

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState {
        rate: ratelimit::RateLimiter::new(
            config.rate_limit.per_user_rpm,
            config.rate_limit.per_ip_rpm,
        ),
        reports: AnalyticsReports::new(Arc::clone(&storage)),
        config,
        tenants,
        users,
        auth,
        storage,
        pipeline,
        memory,
    });
    let router = app::build_router(Arc::clone(&state));

    let addr: SocketAddr = match format!("{}:{}", bind, port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid bind address");
            return EXIT_CONFIG_INVALID;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to bind");
            return EXIT_FATAL;
        }
    };
    info!("cortex gateway listening on {}", addr);

    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });

    let result = serve.await;

    // Clean shutdown: flush buffered memory exchanges and drain analytics
    // before the process exits.
    memory_worker.shutdown().await;
    analytics_worker.shutdown().await;

    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "server error");
            EXIT_FATAL
        }
    }
}
