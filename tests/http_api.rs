//! End-to-end tests over the HTTP surface
//!
//! Each test builds an independent server instance with in-memory adapters
//! and drives it through the router, so nothing here touches the network.
//!
//! Run with: cargo test --test http_api

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use deepmem::adapters::memory::{
    HashingEmbedder, HeuristicAnalyzer, InMemoryGraphStore, InMemoryVectorStore,
};
use deepmem::adapters::{Embedder, VectorPoint};
use deepmem::auth::{AuthConfig, AuthRegistry};
use deepmem::guardrails::GuardrailConfig;
use deepmem::queue::{DurableQueue, QueueConfig};
use deepmem::retriever::RetrieveConfig;
use deepmem::server::audit::AuditLog;
use deepmem::server::{build_state, router, AppConfig, ServerConfig, SharedState, Stores};
use deepmem::types::MemoryPayload;
use deepmem::updater::{SensitiveFilter, UpdateConfig};

struct TestApp {
    state: SharedState,
    router: Router,
    _dir: tempfile::TempDir,
}

fn app(tweak: impl FnOnce(&mut AppConfig)) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores {
        vector: Arc::new(InMemoryVectorStore::new()),
        graph: Arc::new(InMemoryGraphStore::new()),
        embedder: Arc::new(HashingEmbedder::default()),
        analyzer: Arc::new(HeuristicAnalyzer::new()),
    };
    let mut config = AppConfig {
        auth: AuthRegistry::open(),
        guardrails: GuardrailConfig::default(),
        retrieve: RetrieveConfig {
            min_semantic_score: 0.0,
            ..Default::default()
        },
        update: UpdateConfig {
            importance_threshold: 0.0,
            ..Default::default()
        },
        sensitive: SensitiveFilter::disabled(),
        update_queue: QueueConfig {
            base_dir: dir.path().join("update"),
            pump_interval_ms: 10,
            ..Default::default()
        },
        forget_queue: QueueConfig {
            base_dir: dir.path().join("forget"),
            pump_interval_ms: 10,
            ..Default::default()
        },
        server: ServerConfig::default(),
        audit: AuditLog::disabled(),
    };
    tweak(&mut config);
    let state = build_state(stores, config).unwrap();
    let router = router(state.clone());
    TestApp {
        state,
        router,
        _dir: dir,
    }
}

fn auth_rules() -> AuthRegistry {
    AuthRegistry::from_config(&AuthConfig {
        api_keys_json: Some(
            json!([
                { "key": "reader-key", "role": "read", "namespaces": ["*"] },
                { "key": "writer-key", "role": "write", "namespaces": ["*"] },
                { "key": "admin-key", "role": "admin", "namespaces": ["*"] },
                { "key": "ns1-key", "role": "admin", "namespaces": ["ns1"] },
            ])
            .to_string(),
        ),
        ..Default::default()
    })
    .unwrap()
}

async fn call(
    router: &Router,
    method: &str,
    path: &str,
    api_key: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    let request = builder
        .body(match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, headers, value)
}

async fn seed_memory(app: &TestApp, payload: MemoryPayload) {
    let embedder = HashingEmbedder::default();
    let vector = embedder.embed(&payload.content).await.unwrap();
    app.state
        .vector
        .upsert(VectorPoint { vector, payload })
        .await
        .unwrap();
}

fn payload(id: &str, content: &str) -> MemoryPayload {
    MemoryPayload {
        id: id.to_string(),
        namespace: "default".to_string(),
        content: content.to_string(),
        session_id: "seed".to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        importance: 0.5,
        frequency: Some(1),
        ..Default::default()
    }
}

// ============================================================================
// Health and plumbing
// ============================================================================

#[tokio::test]
async fn test_health_and_readyz() {
    let app = app(|_| {});
    let (status, _, body) = call(&app.router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _, body) = call(&app.router, "GET", "/readyz", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_request_id_echoed() {
    let app = app(|_| {});
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("x-request-id", "req-fixed-1")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req-fixed-1"
    );

    // Absent header: a UUID is stamped.
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(!response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .is_empty());
}

// ============================================================================
// Authorization
// ============================================================================

#[tokio::test]
async fn test_role_matrix() {
    let app = app(|c| c.auth = auth_rules());
    let retrieve = json!({ "user_input": "tea", "session_id": "s1" });
    let update = json!({ "session_id": "s1", "messages": [], "async": false });
    let forget = json!({ "memory_ids": ["mem_1"] });

    // No key at all: 401.
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        None,
        Some(retrieve.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    // Reader can retrieve but not update or forget.
    let (status, _, _) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        Some("reader-key"),
        Some(retrieve),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        Some("reader-key"),
        Some(update.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    // Writer can update but not forget or read queue stats.
    let (status, _, _) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        Some("writer-key"),
        Some(update),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = call(
        &app.router,
        "POST",
        "/forget",
        Some("writer-key"),
        Some(forget.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _, _) = call(&app.router, "GET", "/queue/stats", Some("writer-key"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Admin can do everything.
    let (status, _, _) = call(&app.router, "GET", "/queue/stats", Some("admin-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = call(
        &app.router,
        "POST",
        "/forget",
        Some("admin-key"),
        Some(forget),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_namespace_gate() {
    let app = app(|c| c.auth = auth_rules());
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        Some("ns1-key"),
        Some(json!({ "namespace": "ns2", "user_input": "tea", "session_id": "s1" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden_namespace");

    let (status, _, _) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        Some("ns1-key"),
        Some(json!({ "namespace": "ns1", "user_input": "tea", "session_id": "s1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Guardrails
// ============================================================================

#[tokio::test]
async fn test_rate_limit_second_call_429() {
    let app = app(|c| {
        c.guardrails.rate_limit_enabled = true;
        c.guardrails.retrieve_per_window = 1;
    });
    let body = json!({ "user_input": "tea", "session_id": "s1" });
    let (status, _, _) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        None,
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, headers, response) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        None,
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response["error"], "rate_limited");
    let retry_after: u64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
}

#[tokio::test]
async fn test_payload_too_large() {
    let app = app(|c| c.guardrails.max_body_bytes = 64);
    let big = "x".repeat(500);
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        None,
        Some(json!({ "user_input": big, "session_id": "s1" })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "payload_too_large");
}

#[tokio::test]
async fn test_invalid_json() {
    let app = app(|_| {});
    let request = Request::builder()
        .method("POST")
        .uri("/retrieve_context")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "invalid_json");
}

#[tokio::test]
async fn test_disabled_namespace_skipped() {
    let app = app(|c| {
        c.guardrails.disabled_namespaces = vec!["frozen".to_string()];
    });
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        None,
        Some(json!({
            "namespace": "frozen",
            "session_id": "s1",
            "messages": [{ "role": "user", "content": "hello" }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "skipped");
    assert_eq!(body["error"], "namespace_write_disabled");
}

#[tokio::test]
async fn test_backlog_reject() {
    let app = app(|c| {
        c.guardrails.reject_pending = 1;
    });
    // One pending task puts the queue at the reject threshold.
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        None,
        Some(json!({
            "session_id": "s1",
            "messages": [{ "role": "user", "content": "first transcript here" }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");

    let (status, headers, body) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        None,
        Some(json!({
            "session_id": "s2",
            "messages": [{ "role": "user", "content": "second transcript here" }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "queue_overloaded");
    assert!(headers.contains_key("retry-after"));
}

#[tokio::test]
async fn test_backlog_delay_mode() {
    let app = app(|c| {
        c.guardrails.delay_pending = 1;
        c.guardrails.backlog_delay_seconds = 90;
    });
    let (_, _, first) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        None,
        Some(json!({
            "session_id": "s1",
            "messages": [{ "role": "user", "content": "first transcript here" }],
        })),
    )
    .await;
    assert_eq!(first["status"], "queued");
    assert!(first.get("degraded").is_none());

    let (status, _, second) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        None,
        Some(json!({
            "session_id": "s2",
            "messages": [{ "role": "user", "content": "second transcript here" }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "queued");
    assert_eq!(second["degraded"]["mode"], "delayed");
    assert_eq!(second["degraded"]["delay_seconds"], 90);
}

// ============================================================================
// Update pipeline through the API
// ============================================================================

#[tokio::test]
async fn test_sync_update_idempotent() {
    let app = app(|_| {});
    let body = json!({
        "session_id": "s1",
        "messages": [{ "role": "user", "content": "hi" }],
        "async": false,
    });
    let (status, _, first) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        None,
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "processed");

    let (status, _, second) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        None,
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "skipped");
    assert_eq!(second["memories_added"], 0);
    assert_eq!(second["memories_filtered"], 0);
}

#[tokio::test]
async fn test_async_update_queues_then_processes() {
    let app = app(|_| {});
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        None,
        Some(json!({
            "session_id": "s1",
            "messages": [{ "role": "user", "content": "I prefer tea over coffee every day" }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(app.state.update_queue.stats().pending_approx, 1);

    DurableQueue::pump_once(&app.state.update_queue);
    assert!(app.state.update_queue.on_idle(3_000).await);

    // The ingested preference is now retrievable.
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        None,
        Some(json!({ "user_input": "tea or coffee preference", "session_id": "s2" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let memories = body["memories"].as_array().unwrap();
    assert!(!memories.is_empty());
    assert!(memories[0]["id"].as_str().unwrap().starts_with("default::"));
    assert!(body["context"]
        .as_str()
        .unwrap()
        .starts_with("Relevant long-term memory:"));
}

// ============================================================================
// Retrieval semantics through the API
// ============================================================================

#[tokio::test]
async fn test_empty_stores_empty_context() {
    let app = app(|_| {});
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        None,
        Some(json!({ "user_input": "anything", "session_id": "s1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["memories"].as_array().unwrap().len(), 0);
    assert_eq!(body["context"], "");
}

#[tokio::test]
async fn test_slot_conflict_and_expiry() {
    let app = app(|_| {});
    let mut utc8 = payload("default::mem_tz1", "timezone is UTC+8");
    utc8.memory_key = Some("preference:timezone".to_string());
    utc8.created_at = "2020-06-01T00:00:00Z".to_string();
    seed_memory(&app, utc8).await;

    let mut utc = payload("default::mem_tz2", "timezone is UTC");
    utc.memory_key = Some("preference:timezone".to_string());
    utc.created_at = "2021-06-01T00:00:00Z".to_string();
    seed_memory(&app, utc).await;

    let mut gone = payload("default::mem_gone", "timezone reminder for the trip");
    gone.expires_at = Some("2000-01-01T00:00:00Z".to_string());
    seed_memory(&app, gone).await;

    let (status, _, body) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        None,
        Some(json!({ "user_input": "what timezone", "session_id": "s1", "max_memories": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let memories = body["memories"].as_array().unwrap();
    let timezone_slots = memories
        .iter()
        .filter(|m| m["memory_key"] == "preference:timezone")
        .count();
    assert_eq!(timezone_slots, 1);
    assert!(memories.iter().all(|m| m["id"] != "default::mem_gone"));
}

#[tokio::test]
async fn test_max_memories_one() {
    let app = app(|_| {});
    seed_memory(&app, payload("default::m1", "green tea note")).await;
    seed_memory(&app, payload("default::m2", "black tea note")).await;
    let (_, _, body) = call(
        &app.router,
        "POST",
        "/retrieve_context",
        None,
        Some(json!({ "user_input": "tea note", "session_id": "s1", "max_memories": 1 })),
    )
    .await;
    assert_eq!(body["memories"].as_array().unwrap().len(), 1);
}

// ============================================================================
// Forget
// ============================================================================

#[tokio::test]
async fn test_forget_dry_run_audited() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let audit_path_for_config = audit_path.clone();
    let app = app(move |c| {
        c.auth = auth_rules();
        c.audit = AuditLog::new(Some(audit_path_for_config));
    });
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/forget",
        Some("admin-key"),
        Some(json!({ "namespace": "ns1", "memory_ids": ["mem_1"], "dry_run": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "dry_run");
    assert_eq!(body["delete_ids"], 1);
    assert_eq!(body["namespace"], "ns1");
    assert!(!body["request_id"].as_str().unwrap().is_empty());

    let audit = std::fs::read_to_string(&audit_path).unwrap();
    let entry: Value = serde_json::from_str(audit.lines().next().unwrap()).unwrap();
    assert_eq!(entry["action"], "forget");
    assert_eq!(entry["dry_run"], true);
    assert_eq!(entry["memory_ids"][0], "ns1::mem_1");
    // The raw key never reaches the audit log.
    assert!(!audit.contains("admin-key"));
}

#[tokio::test]
async fn test_forget_sync_deletes_both_stores() {
    let app = app(|_| {});
    seed_memory(&app, payload("default::mem_1", "note to be deleted")).await;
    app.state
        .graph
        .upsert_memory(&payload("default::mem_1", "note to be deleted"))
        .await
        .unwrap();

    let (status, _, body) = call(
        &app.router,
        "POST",
        "/forget",
        None,
        Some(json!({ "memory_ids": ["mem_1"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deleted");
    assert_eq!(body["results"]["qdrant"]["by_ids"]["deleted"], 1);
    assert_eq!(body["results"]["neo4j"]["by_ids"]["deleted"], 1);
    assert!(app.state.vector.fetch("default::mem_1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_forget_by_session_cancels_pending() {
    let app = app(|_| {});
    // A pending update for the session that forget must cancel.
    let (_, _, queued) = call(
        &app.router,
        "POST",
        "/update_memory_index",
        None,
        Some(json!({
            "session_id": "s1",
            "messages": [{ "role": "user", "content": "transcript to be forgotten" }],
        })),
    )
    .await;
    assert_eq!(queued["status"], "queued");

    let (status, _, body) = call(
        &app.router,
        "POST",
        "/forget",
        None,
        Some(json!({ "session_id": "s1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"]["queue"]["ok"], true);
    assert_eq!(body["results"]["queue"]["cancelled"], 1);
    assert_eq!(app.state.update_queue.stats().pending_approx, 0);
}

#[tokio::test]
async fn test_forget_async_enqueues() {
    let app = app(|_| {});
    seed_memory(&app, payload("default::mem_1", "note to forget later")).await;
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/forget",
        None,
        Some(json!({ "memory_ids": ["mem_1"], "async": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(app.state.forget_queue.stats().pending_approx, 1);

    DurableQueue::pump_once(&app.state.forget_queue);
    assert!(app.state.forget_queue.on_idle(3_000).await);
    assert!(app.state.vector.fetch("default::mem_1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_forget_requires_target() {
    let app = app(|_| {});
    let (status, _, body) = call(&app.router, "POST", "/forget", None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

// ============================================================================
// Queue admin endpoints
// ============================================================================

#[tokio::test]
async fn test_queue_stats_shape() {
    let app = app(|_| {});
    let (status, _, body) = call(&app.router, "GET", "/queue/stats", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending_approx"], 0);
    assert_eq!(body["failed"], 0);

    let (status, _, _) = call(&app.router, "GET", "/queue/forget/stats", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_queue_failed_export_empty() {
    let app = app(|_| {});
    let (status, _, body) = call(&app.router, "GET", "/queue/failed/export", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "empty");

    let (status, _, body) = call(&app.router, "GET", "/queue/failed", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failed"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_queue_retry_requires_target() {
    let app = app(|_| {});
    let (status, _, body) = call(
        &app.router,
        "POST",
        "/queue/failed/retry",
        None,
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test]
async fn test_metrics_admin_gated_and_public_mode() {
    let admin_app = app(|c| c.auth = auth_rules());
    let (status, _, _) = call(&admin_app.router, "GET", "/metrics", Some("reader-key"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _, body) = call(&admin_app.router, "GET", "/metrics", Some("admin-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("deepmem_queue_pending"));

    let public = app(|c| {
        c.auth = auth_rules();
        c.server.metrics_public = true;
    });
    let (status, _, _) = call(&public.router, "GET", "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);
}
