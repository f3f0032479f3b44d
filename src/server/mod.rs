//! HTTP ingress
//!
//! Builds the application state and the axum router, owns the queue task
//! runners, and handles startup schema checks and graceful drain. The
//! server is an explicit struct (no process globals) so tests can run many
//! independent instances.

pub mod audit;
mod handlers;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::adapters::{Embedder, GraphStore, TranscriptAnalyzer, VectorStore};
use crate::auth::AuthRegistry;
use crate::encoding::decode_messages;
use crate::error::{DeepMemError, Result};
use crate::guardrails::{GuardrailConfig, RateLimiter, RetrieveGauge, UpdateThrottle};
use crate::queue::{DurableQueue, QueueConfig, QueueTask, TaskKind, TaskRunner};
use crate::retriever::{RetrieveConfig, Retriever};
use crate::types::{ForgetResults, QueueCancelOutcome};
use crate::updater::{SensitiveFilter, UpdateConfig, Updater};

use audit::AuditLog;

/// Ingress-level settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Namespace used when a request omits one
    pub default_namespace: String,
    /// Update-queue depth above which retrieval drops the relation leg;
    /// 0 disables
    pub retrieve_degrade_related_pending: usize,
    /// Serve `/metrics` without authentication
    pub metrics_public: bool,
    /// Hard timeout for dependency probes
    pub probe_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_namespace: "default".to_string(),
            retrieve_degrade_related_pending: 0,
            metrics_public: false,
            probe_timeout_ms: 1_500,
        }
    }
}

/// Schema validation behavior at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationsMode {
    Off,
    #[default]
    Validate,
    Apply,
}

impl std::str::FromStr for MigrationsMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(MigrationsMode::Off),
            "validate" => Ok(MigrationsMode::Validate),
            "apply" => Ok(MigrationsMode::Apply),
            _ => Err(format!("Unknown migrations mode: {}", s)),
        }
    }
}

/// Everything the handlers need, built once per server instance
pub struct AppState {
    pub auth: AuthRegistry,
    pub guardrails: GuardrailConfig,
    pub rate_limiter: RateLimiter,
    pub throttle: UpdateThrottle,
    pub retrieve_gauge: RetrieveGauge,
    pub retriever: Retriever,
    pub update_queue: Arc<DurableQueue>,
    pub forget_queue: Arc<DurableQueue>,
    pub vector: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub audit: AuditLog,
    pub config: ServerConfig,
    pub started_at: Instant,
    pub requests_total: AtomicU64,
}

pub type SharedState = Arc<AppState>;

/// Adapter bundle wired into a server
pub struct Stores {
    pub vector: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub embedder: Arc<dyn Embedder>,
    pub analyzer: Arc<dyn TranscriptAnalyzer>,
}

/// Library-level configuration for one server instance
pub struct AppConfig {
    pub auth: AuthRegistry,
    pub guardrails: GuardrailConfig,
    pub retrieve: RetrieveConfig,
    pub update: UpdateConfig,
    pub sensitive: SensitiveFilter,
    pub update_queue: QueueConfig,
    pub forget_queue: QueueConfig,
    pub server: ServerConfig,
    pub audit: AuditLog,
}

/// Build the application state: retriever, updater, and both queues with
/// their runners. Queues are initialized (crash recovery) but their
/// schedulers are not spawned; call [`spawn_schedulers`] for that.
pub fn build_state(stores: Stores, config: AppConfig) -> Result<SharedState> {
    let retriever = Retriever::new(
        Arc::clone(&stores.vector),
        Arc::clone(&stores.graph),
        Arc::clone(&stores.embedder),
        config.retrieve,
    );
    let updater = Arc::new(Updater::new(
        Arc::clone(&stores.vector),
        Arc::clone(&stores.graph),
        Arc::clone(&stores.embedder),
        Arc::clone(&stores.analyzer),
        config.sensitive,
        config.update,
    ));

    let update_runner = Arc::new(UpdateTaskRunner {
        updater: Arc::clone(&updater),
    });
    let update_queue = DurableQueue::new(config.update_queue, update_runner)?;
    update_queue.init()?;

    let forget_runner = Arc::new(ForgetTaskRunner {
        vector: Arc::clone(&stores.vector),
        graph: Arc::clone(&stores.graph),
        update_queue: Arc::clone(&update_queue),
    });
    let forget_queue = DurableQueue::new(config.forget_queue, forget_runner)?;
    forget_queue.init()?;

    let rate_limiter = RateLimiter::new(
        config.guardrails.rate_limit_enabled,
        config.guardrails.rate_limit_window_ms,
    );
    let throttle = UpdateThrottle::new(config.guardrails.min_interval_ms);
    let retrieve_gauge = RetrieveGauge::new(config.guardrails.namespace_retrieve_concurrency);

    Ok(Arc::new(AppState {
        auth: config.auth,
        guardrails: config.guardrails,
        rate_limiter,
        throttle,
        retrieve_gauge,
        retriever,
        update_queue,
        forget_queue,
        vector: stores.vector,
        graph: stores.graph,
        audit: config.audit,
        config: config.server,
        started_at: Instant::now(),
        requests_total: AtomicU64::new(0),
    }))
}

/// Start the background schedulers for both queues
pub fn spawn_schedulers(state: &SharedState) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        DurableQueue::spawn_scheduler(&state.update_queue),
        DurableQueue::spawn_scheduler(&state.forget_queue),
    ]
}

/// Stop accepting queue work and wait for in-flight tasks to drain
pub async fn drain(state: &SharedState, timeout_ms: u64) -> bool {
    state.update_queue.stop();
    state.forget_queue.stop();
    let updates_drained = state.update_queue.on_idle(timeout_ms).await;
    let forgets_drained = state.forget_queue.on_idle(timeout_ms).await;
    updates_drained && forgets_drained
}

/// Probe both adapters' schemas at startup.
///
/// With `strict`, a not-ready adapter is a fatal configuration error
/// (non-zero exit); otherwise the server starts degraded.
pub async fn check_schemas(
    vector: &Arc<dyn VectorStore>,
    graph: &Arc<dyn GraphStore>,
    mode: MigrationsMode,
    strict: bool,
) -> Result<bool> {
    if mode == MigrationsMode::Off {
        return Ok(true);
    }
    let vector_ready = vector.schema_ready().await.unwrap_or(false);
    let graph_ready = graph.schema_ready().await.unwrap_or(false);
    let ready = vector_ready && graph_ready;
    if !ready {
        if strict {
            return Err(DeepMemError::Config(format!(
                "schema not ready (vector: {}, graph: {})",
                vector_ready, graph_ready
            )));
        }
        tracing::warn!(
            "starting degraded: schema not ready (vector: {}, graph: {})",
            vector_ready,
            graph_ready
        );
    }
    Ok(ready)
}

/// Build the axum router over shared state
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/retrieve_context", post(handlers::retrieve_context))
        .route("/update_memory_index", post(handlers::update_memory_index))
        .route("/forget", post(handlers::forget))
        .route("/health", get(handlers::health))
        .route("/health/details", get(handlers::health_details))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .route("/queue/stats", get(handlers::update_queue_stats))
        .route("/queue/failed", get(handlers::update_queue_failed))
        .route(
            "/queue/failed/export",
            get(handlers::update_queue_failed_export),
        )
        .route(
            "/queue/failed/retry",
            post(handlers::update_queue_failed_retry),
        )
        .route("/queue/forget/stats", get(handlers::forget_queue_stats))
        .route("/queue/forget/failed", get(handlers::forget_queue_failed))
        .route(
            "/queue/forget/failed/export",
            get(handlers::forget_queue_failed_export),
        )
        .route(
            "/queue/forget/failed/retry",
            post(handlers::forget_queue_failed_retry),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_id_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Request id stashed into request extensions by the middleware
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

async fn request_id_middleware(
    axum::extract::State(state): axum::extract::State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

// ============================================================================
// Queue task runners
// ============================================================================

/// Update-queue worker: decode the gzip transcript and run the ingestion
/// pipeline
struct UpdateTaskRunner {
    updater: Arc<Updater>,
}

#[async_trait]
impl TaskRunner for UpdateTaskRunner {
    async fn run(&self, task: &QueueTask) -> Result<Option<serde_json::Value>> {
        if task.kind != TaskKind::Update {
            return Err(DeepMemError::Queue(format!(
                "update queue received {} task",
                task.kind.as_str()
            )));
        }
        let session_id = task
            .session_id
            .as_deref()
            .ok_or_else(|| DeepMemError::Queue("update task missing session_id".into()))?;
        let payload = task
            .messages_gzip
            .as_deref()
            .ok_or_else(|| DeepMemError::Queue("update task missing transcript".into()))?;
        let messages = decode_messages(payload)?;
        let outcome = self
            .updater
            .update(&task.namespace, session_id, &messages)
            .await?;
        Ok(Some(serde_json::to_value(outcome)?))
    }
}

/// Forget-queue worker: the same dual delete the synchronous path performs,
/// with per-backend outcomes recorded on the task result
struct ForgetTaskRunner {
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    update_queue: Arc<DurableQueue>,
}

#[async_trait]
impl TaskRunner for ForgetTaskRunner {
    async fn run(&self, task: &QueueTask) -> Result<Option<serde_json::Value>> {
        if task.kind != TaskKind::Forget {
            return Err(DeepMemError::Queue(format!(
                "forget queue received {} task",
                task.kind.as_str()
            )));
        }
        let results = execute_forget(
            &self.vector,
            &self.graph,
            &self.update_queue,
            &task.namespace,
            task.session_id.as_deref(),
            task.memory_ids.as_deref(),
        )
        .await;
        Ok(Some(serde_json::to_value(results)?))
    }
}

/// Best-effort dual delete across the vector store, the graph store, and
/// the pending update queue. Shared by the synchronous forget path and the
/// forget-queue worker.
pub async fn execute_forget(
    vector: &Arc<dyn VectorStore>,
    graph: &Arc<dyn GraphStore>,
    update_queue: &Arc<DurableQueue>,
    namespace: &str,
    session_id: Option<&str>,
    memory_ids: Option<&[String]>,
) -> ForgetResults {
    let mut results = ForgetResults::default();

    if let Some(session_id) = session_id {
        let cancelled = update_queue.cancel_by_session(namespace, session_id);
        results.queue = QueueCancelOutcome {
            ok: true,
            cancelled: Some(cancelled),
            error: None,
        };
        results.qdrant.by_session = Some(outcome_value(
            vector.delete_by_session(namespace, session_id).await,
        ));
        results.neo4j.by_session = Some(outcome_value(
            graph.delete_by_session(namespace, session_id).await,
        ));
    } else {
        results.queue.ok = true;
    }

    if let Some(ids) = memory_ids {
        results.qdrant.by_ids = Some(outcome_value(vector.delete_by_ids(ids).await));
        results.neo4j.by_ids = Some(outcome_value(graph.delete_by_ids(ids).await));
    }

    results
}

fn outcome_value(result: Result<usize>) -> serde_json::Value {
    match result {
        Ok(count) => json!({ "deleted": count }),
        Err(e) => json!({ "error": e.to_string() }),
    }
}

/// Probe an adapter with the configured hard timeout
pub async fn probe<F>(fut: F, timeout_ms: u64) -> bool
where
    F: std::future::Future<Output = Result<()>>,
{
    matches!(
        tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await,
        Ok(Ok(()))
    )
}
