//! Deep-Memory HTTP server
//!
//! Run with: deepmem-server

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deepmem::adapters::memory::{
    HashingEmbedder, HeuristicAnalyzer, InMemoryGraphStore, InMemoryVectorStore,
};
use deepmem::auth::{AuthConfig, AuthRegistry};
use deepmem::guardrails::GuardrailConfig;
use deepmem::queue::QueueConfig;
use deepmem::retriever::RetrieveConfig;
use deepmem::server::audit::AuditLog;
use deepmem::server::{
    build_state, check_schemas, drain, router, spawn_schedulers, AppConfig, MigrationsMode,
    ServerConfig, Stores,
};
use deepmem::updater::{SensitiveConfig, SensitiveFilter, UpdateConfig};

#[derive(Parser, Debug)]
#[command(name = "deepmem-server")]
#[command(about = "Deep-memory server for conversational agents")]
struct Args {
    /// Bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    bind: String,

    /// HTTP port
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Namespace assumed when a request omits one
    #[arg(long, env = "DEFAULT_NAMESPACE", default_value = "default")]
    default_namespace: String,

    // ── Authorization ──────────────────────────────────────────────
    /// Single legacy API key (admin, all namespaces)
    #[arg(long, env = "API_KEY")]
    api_key: Option<String>,

    /// Legacy CSV of API keys (admin, all namespaces)
    #[arg(long, env = "API_KEYS")]
    api_keys: Option<String>,

    /// JSON rule table: [{"key","role","namespaces"}]
    #[arg(long, env = "API_KEYS_JSON")]
    api_keys_json: Option<String>,

    /// Refuse to start open even with zero keys configured
    #[arg(long, env = "REQUIRE_API_KEY", default_value_t = false)]
    require_api_key: bool,

    // ── Body / rate guardrails ─────────────────────────────────────
    #[arg(long, env = "MAX_BODY_BYTES", default_value = "262144")]
    max_body_bytes: usize,

    #[arg(long, env = "MAX_UPDATE_BODY_BYTES", default_value = "2097152")]
    max_update_body_bytes: usize,

    #[arg(long, env = "RATE_LIMIT_ENABLED", default_value_t = false)]
    rate_limit_enabled: bool,

    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value = "60000")]
    rate_limit_window_ms: u64,

    #[arg(long, env = "RATE_LIMIT_RETRIEVE_PER_WINDOW", default_value = "600")]
    rate_limit_retrieve_per_window: u64,

    #[arg(long, env = "RATE_LIMIT_UPDATE_PER_WINDOW", default_value = "120")]
    rate_limit_update_per_window: u64,

    #[arg(long, env = "RATE_LIMIT_FORGET_PER_WINDOW", default_value = "60")]
    rate_limit_forget_per_window: u64,

    // ── Update backlog shedding ────────────────────────────────────
    /// Pending depth that flips updates read-only (0 = off)
    #[arg(long, env = "UPDATE_BACKLOG_READ_ONLY_PENDING", default_value = "0")]
    update_backlog_read_only_pending: usize,

    /// Pending depth that rejects updates with 503 (0 = off)
    #[arg(long, env = "UPDATE_BACKLOG_REJECT_PENDING", default_value = "0")]
    update_backlog_reject_pending: usize,

    /// Pending depth that delays enqueued updates (0 = off)
    #[arg(long, env = "UPDATE_BACKLOG_DELAY_PENDING", default_value = "0")]
    update_backlog_delay_pending: usize,

    #[arg(long, env = "UPDATE_BACKLOG_DELAY_SECONDS", default_value = "60")]
    update_backlog_delay_seconds: u64,

    #[arg(long, env = "UPDATE_BACKLOG_RETRY_AFTER_SECONDS", default_value = "30")]
    update_backlog_retry_after_seconds: u64,

    /// CSV of namespaces with writes switched off
    #[arg(long, env = "UPDATE_DISABLED_NAMESPACES", default_value = "")]
    update_disabled_namespaces: String,

    #[arg(long, env = "UPDATE_MIN_INTERVAL_MS", default_value = "0")]
    update_min_interval_ms: u64,

    /// Deterministic ingest sampling rate in [0, 1]
    #[arg(long, env = "UPDATE_SAMPLE_RATE", default_value = "1.0")]
    update_sample_rate: f64,

    #[arg(long, env = "NAMESPACE_RETRIEVE_CONCURRENCY", default_value = "0")]
    namespace_retrieve_concurrency: usize,

    #[arg(long, env = "NAMESPACE_UPDATE_CONCURRENCY", default_value = "0")]
    namespace_update_concurrency: usize,

    /// Queue worker fan-out
    #[arg(long, env = "UPDATE_CONCURRENCY", default_value = "2")]
    update_concurrency: usize,

    /// Update-queue depth above which retrieval drops the relation leg
    #[arg(long, env = "RETRIEVE_DEGRADE_RELATED_PENDING", default_value = "0")]
    retrieve_degrade_related_pending: usize,

    // ── Durable queues ─────────────────────────────────────────────
    #[arg(long, env = "QUEUE_DIR", default_value = "./data/queue")]
    queue_dir: PathBuf,

    #[arg(long, env = "QUEUE_MAX_ATTEMPTS", default_value = "5")]
    queue_max_attempts: u32,

    #[arg(long, env = "QUEUE_RETRY_BASE_MS", default_value = "2000")]
    queue_retry_base_ms: u64,

    #[arg(long, env = "QUEUE_RETRY_MAX_MS", default_value = "300000")]
    queue_retry_max_ms: u64,

    #[arg(long, env = "QUEUE_KEEP_DONE", default_value_t = false)]
    queue_keep_done: bool,

    #[arg(long, env = "QUEUE_RETENTION_DAYS", default_value = "7")]
    queue_retention_days: u64,

    #[arg(long, env = "QUEUE_MAX_TASK_BYTES", default_value = "1500000")]
    queue_max_task_bytes: usize,

    // ── Retrieval scoring ──────────────────────────────────────────
    #[arg(long, env = "MIN_SEMANTIC_SCORE", default_value = "0.3")]
    min_semantic_score: f32,

    #[arg(long, env = "SEMANTIC_WEIGHT", default_value = "0.6")]
    semantic_weight: f32,

    #[arg(long, env = "RELATION_WEIGHT", default_value = "0.4")]
    relation_weight: f32,

    #[arg(long, env = "DECAY_HALF_LIFE_DAYS", default_value = "90")]
    decay_half_life_days: f64,

    #[arg(long, env = "IMPORTANCE_BOOST", default_value = "0.3")]
    importance_boost: f32,

    #[arg(long, env = "FREQUENCY_BOOST", default_value = "0.2")]
    frequency_boost: f32,

    #[arg(long, env = "RETRIEVE_DEFAULT_MAX_MEMORIES", default_value = "5")]
    retrieve_default_max_memories: usize,

    /// Retrieve-cache TTL; 0 disables the cache
    #[arg(long, env = "RETRIEVE_CACHE_TTL_SECS", default_value = "0")]
    retrieve_cache_ttl_secs: u64,

    #[arg(long, env = "RETRIEVE_CACHE_MAX_ENTRIES", default_value = "512")]
    retrieve_cache_max_entries: usize,

    // ── Ingestion ──────────────────────────────────────────────────
    #[arg(long, env = "IMPORTANCE_THRESHOLD", default_value = "0.3")]
    importance_threshold: f32,

    #[arg(long, env = "MAX_MEMORIES_PER_UPDATE", default_value = "10")]
    max_memories_per_update: usize,

    #[arg(long, env = "DEDUPE_SCORE", default_value = "0.92")]
    dedupe_score: f32,

    #[arg(long, env = "RELATED_TOPK", default_value = "3")]
    related_topk: usize,

    #[arg(long, env = "SENSITIVE_FILTER_ENABLED", default_value_t = true)]
    sensitive_filter_enabled: bool,

    #[arg(long, env = "SENSITIVE_RULESET_VERSION")]
    sensitive_ruleset_version: Option<String>,

    /// JSON list of extra sensitive-content regexes
    #[arg(long, env = "SENSITIVE_FILTER_RULES")]
    sensitive_filter_rules: Option<String>,

    /// Hashing-embedder dimensions (dev mode)
    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value = "256")]
    embedding_dimensions: usize,

    // ── Operations ─────────────────────────────────────────────────
    /// JSON Lines audit log for forget and queue-admin actions
    #[arg(long, env = "AUDIT_LOG_PATH")]
    audit_log_path: Option<PathBuf>,

    /// Schema handling at startup: off, validate, apply
    #[arg(long, env = "MIGRATIONS_MODE", default_value = "validate")]
    migrations_mode: String,

    /// Exit non-zero when a store schema is not ready
    #[arg(long, env = "MIGRATIONS_STRICT", default_value_t = false)]
    migrations_strict: bool,

    /// Serve /metrics without authentication
    #[arg(long, env = "METRICS_PUBLIC", default_value_t = false)]
    metrics_public: bool,

    /// Graceful-drain budget on shutdown
    #[arg(long, env = "SHUTDOWN_DRAIN_MS", default_value = "10000")]
    shutdown_drain_ms: u64,
}

impl Args {
    fn guardrails(&self) -> GuardrailConfig {
        GuardrailConfig {
            max_body_bytes: self.max_body_bytes,
            max_update_body_bytes: self.max_update_body_bytes,
            rate_limit_enabled: self.rate_limit_enabled,
            rate_limit_window_ms: self.rate_limit_window_ms,
            retrieve_per_window: self.rate_limit_retrieve_per_window,
            update_per_window: self.rate_limit_update_per_window,
            forget_per_window: self.rate_limit_forget_per_window,
            read_only_pending: self.update_backlog_read_only_pending,
            reject_pending: self.update_backlog_reject_pending,
            delay_pending: self.update_backlog_delay_pending,
            backlog_retry_after_secs: self.update_backlog_retry_after_seconds,
            backlog_delay_seconds: self.update_backlog_delay_seconds,
            disabled_namespaces: self
                .update_disabled_namespaces
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            min_interval_ms: self.update_min_interval_ms,
            sample_rate: self.update_sample_rate,
            namespace_retrieve_concurrency: self.namespace_retrieve_concurrency,
        }
    }

    fn retrieve(&self) -> RetrieveConfig {
        RetrieveConfig {
            min_semantic_score: self.min_semantic_score,
            semantic_weight: self.semantic_weight,
            relation_weight: self.relation_weight,
            half_life_days: self.decay_half_life_days,
            importance_boost: self.importance_boost,
            frequency_boost: self.frequency_boost,
            default_max_memories: self.retrieve_default_max_memories,
            cache_ttl_secs: self.retrieve_cache_ttl_secs,
            cache_max_entries: self.retrieve_cache_max_entries,
        }
    }

    fn update(&self) -> UpdateConfig {
        UpdateConfig {
            importance_threshold: self.importance_threshold,
            max_memories_per_update: self.max_memories_per_update,
            dedupe_score: self.dedupe_score,
            related_top_k: self.related_topk,
            min_semantic_score: self.min_semantic_score,
        }
    }

    fn queue(&self, sub_dir: &str) -> QueueConfig {
        QueueConfig {
            base_dir: self.queue_dir.join(sub_dir),
            concurrency: self.update_concurrency.max(1),
            namespace_concurrency: self.namespace_update_concurrency,
            max_attempts: self.queue_max_attempts.max(1),
            retry_base_ms: self.queue_retry_base_ms,
            retry_max_ms: self.queue_retry_max_ms,
            keep_done: self.queue_keep_done,
            retention_days: self.queue_retention_days,
            max_task_bytes: self.queue_max_task_bytes,
            ..Default::default()
        }
    }

    fn server(&self) -> ServerConfig {
        ServerConfig {
            default_namespace: self.default_namespace.clone(),
            retrieve_degrade_related_pending: self.retrieve_degrade_related_pending,
            metrics_public: self.metrics_public,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let auth = AuthRegistry::from_config(&AuthConfig {
        api_key: args.api_key.clone(),
        api_keys_csv: args.api_keys.clone(),
        api_keys_json: args.api_keys_json.clone(),
        require_api_key: args.require_api_key,
    })
    .context("invalid API key configuration")?;

    let sensitive = SensitiveFilter::from_config(&SensitiveConfig {
        enabled: args.sensitive_filter_enabled,
        ruleset_version: args.sensitive_ruleset_version.clone(),
        custom_rules_json: args.sensitive_filter_rules.clone(),
    })
    .context("invalid sensitive filter configuration")?;

    // Dev-mode adapters: everything in process. Production deployments
    // swap these for Qdrant/Neo4j-backed implementations of the same
    // traits.
    let stores = Stores {
        vector: Arc::new(InMemoryVectorStore::new()),
        graph: Arc::new(InMemoryGraphStore::new()),
        embedder: Arc::new(HashingEmbedder::new(args.embedding_dimensions)),
        analyzer: Arc::new(HeuristicAnalyzer::new()),
    };

    let mode: MigrationsMode = args
        .migrations_mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    check_schemas(&stores.vector, &stores.graph, mode, args.migrations_strict)
        .await
        .context("store schema validation failed")?;

    let state = build_state(
        stores,
        AppConfig {
            auth,
            guardrails: args.guardrails(),
            retrieve: args.retrieve(),
            update: args.update(),
            sensitive,
            update_queue: args.queue("update"),
            forget_queue: args.queue("forget"),
            server: args.server(),
            audit: AuditLog::new(args.audit_log_path.clone()),
        },
    )
    .context("failed to build server state")?;

    let schedulers = spawn_schedulers(&state);
    let app = router(state.clone());

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("deep-memory server v{} listening on {}", deepmem::VERSION, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down, draining queues");
    if !drain(&state, args.shutdown_drain_ms).await {
        tracing::warn!("queues did not drain within {} ms", args.shutdown_drain_ms);
    }
    for handle in schedulers {
        handle.abort();
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
