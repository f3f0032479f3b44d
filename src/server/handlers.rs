//! Endpoint handlers
//!
//! Every handler authenticates, applies its guardrails, then delegates to
//! the retriever, updater, or queues. Failures always surface as JSON
//! bodies with the taxonomy's `error` kind; stack traces and HTML never
//! leave the process.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Query, State};
use axum::http::header::{HeaderMap, CONTENT_LENGTH, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::{AuthContext, Role};
use crate::encoding::{encode_messages, transcript_hash};
use crate::error::{DeepMemError, Result};
use crate::guardrails::{check_content_length, decode_json, BacklogDecision};
use crate::queue::{DurableQueue, QueueTask};
use crate::retriever::RetrieveInput;
use crate::types::{
    qualify_id, ForgetRequest, ForgetResponse, RetrieveRequest, UpdateRequest, UpdateResponse,
    UpdateStatus,
};

use super::audit::AuditEntry;
use super::{execute_forget, probe, RequestId, SharedState};

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn respond<T: Serialize>(status: StatusCode, body: T, retry_after: Option<u64>) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Some(secs) = retry_after {
        if let Ok(value) = secs.to_string().parse() {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
    }
    response
}

fn error_response(err: &DeepMemError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let retry_after = match err {
        DeepMemError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
        DeepMemError::QueueOverloaded {
            retry_after_secs, ..
        } => Some(*retry_after_secs),
        _ => None,
    };
    respond(status, json!({ "error": err.kind() }), retry_after)
}

/// Authenticate, rate-limit, and decode one request body
fn admit<T: serde::de::DeserializeOwned>(
    state: &SharedState,
    headers: &HeaderMap,
    body: &Bytes,
    min_role: Role,
    route: &str,
    per_window: u64,
    body_limit: usize,
) -> Result<(AuthContext, T)> {
    let ctx = state.auth.authorize(api_key(headers), min_role)?;
    state
        .rate_limiter
        .check(ctx.audit_key_id(), route, per_window)?;
    check_content_length(content_length(headers), body_limit)?;
    let request = decode_json::<T>(body, body_limit)?;
    Ok((ctx, request))
}

// ============================================================================
// Retrieve
// ============================================================================

pub async fn retrieve_context(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (ctx, request): (_, RetrieveRequest) = match admit(
        &state,
        &headers,
        &body,
        Role::Read,
        "retrieve",
        state.guardrails.retrieve_per_window,
        state.guardrails.max_body_bytes,
    ) {
        Ok(admitted) => admitted,
        Err(e) => return error_response(&e),
    };

    if request.session_id.is_empty() || request.user_input.trim().is_empty() {
        return error_response(&DeepMemError::InvalidRequest(
            "session_id and user_input are required".into(),
        ));
    }

    let namespace = request
        .namespace
        .unwrap_or_else(|| state.config.default_namespace.clone());
    if let Err(e) = ctx.assert_namespace(&namespace) {
        return error_response(&e);
    }

    // Guaranteed release: the permit frees its slot on drop.
    let _permit = match state.retrieve_gauge.acquire(&namespace) {
        Ok(permit) => permit,
        Err(e) => return error_response(&e),
    };

    // Under severe update backlog, drop the relation leg so retrieval load
    // on the graph store falls away.
    let degrade_threshold = state.config.retrieve_degrade_related_pending;
    let degraded = degrade_threshold > 0
        && state.update_queue.stats().pending_approx >= degrade_threshold;
    let (entities, topics) = if degraded {
        (Vec::new(), Vec::new())
    } else {
        (request.entities, request.topics)
    };

    let response = state
        .retriever
        .retrieve(RetrieveInput {
            namespace,
            user_input: request.user_input,
            session_id: request.session_id,
            max_memories: request
                .max_memories
                .unwrap_or(state.retriever.config().default_max_memories),
            entities,
            topics,
        })
        .await;
    respond(StatusCode::OK, response, None)
}

// ============================================================================
// Update
// ============================================================================

pub async fn update_memory_index(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (ctx, request): (_, UpdateRequest) = match admit(
        &state,
        &headers,
        &body,
        Role::Write,
        "update",
        state.guardrails.update_per_window,
        state.guardrails.max_update_body_bytes,
    ) {
        Ok(admitted) => admitted,
        Err(e) => return error_response(&e),
    };

    if request.session_id.is_empty() {
        return error_response(&DeepMemError::InvalidRequest("session_id is required".into()));
    }

    let namespace = request
        .namespace
        .unwrap_or_else(|| state.config.default_namespace.clone());
    if let Err(e) = ctx.assert_namespace(&namespace) {
        return error_response(&e);
    }

    if state.guardrails.namespace_write_disabled(&namespace) {
        return respond(
            StatusCode::OK,
            UpdateResponse::skipped("namespace_write_disabled"),
            None,
        );
    }
    if state
        .guardrails
        .sampled_out(&namespace, &request.session_id, request.messages.len())
    {
        return respond(StatusCode::OK, UpdateResponse::skipped("sampled_out"), None);
    }
    if let Err(DeepMemError::RateLimited { retry_after_secs }) =
        state.throttle.check(&namespace, &request.session_id)
    {
        return respond(
            StatusCode::OK,
            UpdateResponse::skipped("throttled"),
            Some(retry_after_secs),
        );
    }

    let hash = match transcript_hash(&request.messages) {
        Ok(hash) => hash,
        Err(e) => return error_response(&e),
    };

    if request.async_mode {
        // Backlog shedding applies to the async branch only; a synchronous
        // caller already pays the full pipeline latency itself.
        let pending = state.update_queue.stats().pending_approx;
        let decision = state.guardrails.backlog_decision(pending);
        let not_before_ms = match decision {
            BacklogDecision::ReadOnly { retry_after_secs } => {
                return respond(
                    StatusCode::OK,
                    UpdateResponse::skipped("degraded_read_only"),
                    Some(retry_after_secs),
                );
            }
            BacklogDecision::Reject { retry_after_secs } => {
                return error_response(&DeepMemError::QueueOverloaded {
                    pending,
                    retry_after_secs,
                });
            }
            BacklogDecision::Delay { not_before_ms, .. } => not_before_ms,
            BacklogDecision::Allow => 0,
        };

        let gzip = match encode_messages(&request.messages) {
            Ok(gzip) => gzip,
            Err(e) => return error_response(&e),
        };
        let task = QueueTask::update(
            &namespace,
            &request.session_id,
            hash,
            request.messages.len(),
            gzip,
            not_before_ms,
        );
        if let Err(e) = state.update_queue.enqueue(task) {
            return error_response(&e);
        }
        state.throttle.note(&namespace, &request.session_id);

        let mut response = UpdateResponse::queued();
        if let BacklogDecision::Delay {
            not_before_ms,
            delay_seconds,
        } = decision
        {
            response.degraded = Some(crate::types::DegradedInfo {
                mode: "delayed".to_string(),
                not_before_ms: Some(not_before_ms),
                delay_seconds: Some(delay_seconds),
            });
        }
        return respond(StatusCode::OK, response, None);
    }

    // Synchronous path: run under the per-key lock so queue workers and
    // sync callers never interleave on one session.
    let gzip = match encode_messages(&request.messages) {
        Ok(gzip) => gzip,
        Err(e) => return error_response(&e),
    };
    let task = QueueTask::update(&namespace, &request.session_id, hash, request.messages.len(), gzip, 0);
    state.throttle.note(&namespace, &request.session_id);
    match state.update_queue.run_now(task).await {
        Ok(Some(value)) => respond(StatusCode::OK, value, None),
        Ok(None) => respond(
            StatusCode::OK,
            UpdateResponse {
                status: UpdateStatus::Processed,
                memories_added: 0,
                memories_filtered: 0,
                error: None,
                degraded: None,
            },
            None,
        ),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            UpdateResponse {
                status: UpdateStatus::Error,
                memories_added: 0,
                memories_filtered: 0,
                error: Some(e.to_string()),
                degraded: None,
            },
            None,
        ),
    }
}

// ============================================================================
// Forget
// ============================================================================

pub async fn forget(
    State(state): State<SharedState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (ctx, request): (_, ForgetRequest) = match admit(
        &state,
        &headers,
        &body,
        Role::Admin,
        "forget",
        state.guardrails.forget_per_window,
        state.guardrails.max_body_bytes,
    ) {
        Ok(admitted) => admitted,
        Err(e) => return error_response(&e),
    };

    let namespace = request
        .namespace
        .unwrap_or_else(|| state.config.default_namespace.clone());
    if let Err(e) = ctx.assert_namespace(&namespace) {
        return error_response(&e);
    }

    let ids: Option<Vec<String>> = request.memory_ids.map(|ids| {
        ids.iter()
            .map(|id| qualify_id(&namespace, id))
            .collect()
    });
    let has_ids = ids.as_ref().is_some_and(|ids| !ids.is_empty());
    let has_session = request.session_id.as_deref().is_some_and(|s| !s.is_empty());
    if !has_ids && !has_session {
        return error_response(&DeepMemError::InvalidRequest(
            "memory_ids or session_id is required".into(),
        ));
    }

    state.audit.append(
        AuditEntry::new("forget", &namespace, ctx.audit_key_id())
            .with_session(request.session_id.as_deref())
            .with_memory_ids(ids.as_deref())
            .with_dry_run(request.dry_run)
            .with_request_id(&request_id.0),
    );

    if request.dry_run {
        return respond(
            StatusCode::OK,
            ForgetResponse {
                status: "dry_run".to_string(),
                namespace,
                request_id: request_id.0,
                deleted: None,
                delete_ids: ids.as_ref().map(|ids| ids.len()),
                delete_session: has_session.then_some(true),
                results: None,
            },
            None,
        );
    }

    if request.async_mode {
        let task = match (&request.session_id, &ids) {
            (Some(session_id), _) if has_session => {
                QueueTask::forget_session(&namespace, session_id)
            }
            (_, Some(ids)) => QueueTask::forget_ids(&namespace, ids.clone()),
            _ => unreachable!("validated above"),
        };
        if let Err(e) = state.forget_queue.enqueue(task) {
            return error_response(&e);
        }
        return respond(
            StatusCode::OK,
            ForgetResponse {
                status: "queued".to_string(),
                namespace,
                request_id: request_id.0,
                deleted: None,
                delete_ids: ids.as_ref().map(|ids| ids.len()),
                delete_session: has_session.then_some(true),
                results: None,
            },
            None,
        );
    }

    let results = execute_forget(
        &state.vector,
        &state.graph,
        &state.update_queue,
        &namespace,
        request.session_id.as_deref().filter(|s| !s.is_empty()),
        ids.as_deref(),
    )
    .await;

    respond(
        StatusCode::OK,
        ForgetResponse {
            status: "deleted".to_string(),
            namespace,
            request_id: request_id.0,
            deleted: Some(true),
            delete_ids: ids.as_ref().map(|ids| ids.len()),
            delete_session: has_session.then_some(true),
            results: Some(results),
        },
        None,
    )
}

// ============================================================================
// Health & metrics
// ============================================================================

pub async fn health() -> Response {
    respond(StatusCode::OK, json!({ "status": "ok" }), None)
}

pub async fn health_details(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(e) = state.auth.authorize(api_key(&headers), Role::Admin) {
        return error_response(&e);
    }
    let timeout = state.config.probe_timeout_ms;
    let vector_ok = probe(state.vector.ping(), timeout).await;
    let graph_ok = probe(state.graph.ping(), timeout).await;
    respond(
        StatusCode::OK,
        json!({
            "status": if vector_ok && graph_ok { "ok" } else { "degraded" },
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "auth_required": state.auth.required(),
            "queues": {
                "update": state.update_queue.stats(),
                "forget": state.forget_queue.stats(),
            },
            "deps": {
                "qdrant": { "ok": vector_ok },
                "neo4j": { "ok": graph_ok },
            },
        }),
        None,
    )
}

pub async fn readyz(State(state): State<SharedState>) -> Response {
    let timeout = state.config.probe_timeout_ms;
    let vector_ok = probe(state.vector.ping(), timeout).await;
    let graph_ok = probe(state.graph.ping(), timeout).await;
    if vector_ok && graph_ok {
        respond(StatusCode::OK, json!({ "status": "ready" }), None)
    } else {
        respond(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "error": "not_ready",
                "deps": {
                    "qdrant": { "ok": vector_ok },
                    "neo4j": { "ok": graph_ok },
                },
            }),
            None,
        )
    }
}

pub async fn metrics(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if !state.config.metrics_public {
        if let Err(e) = state.auth.authorize(api_key(&headers), Role::Admin) {
            return error_response(&e);
        }
    }
    let update = state.update_queue.stats();
    let forget = state.forget_queue.stats();
    let body = format!(
        concat!(
            "# TYPE deepmem_requests_total counter\n",
            "deepmem_requests_total {}\n",
            "# TYPE deepmem_uptime_seconds gauge\n",
            "deepmem_uptime_seconds {}\n",
            "# TYPE deepmem_queue_pending gauge\n",
            "deepmem_queue_pending{{queue=\"update\"}} {}\n",
            "deepmem_queue_pending{{queue=\"forget\"}} {}\n",
            "# TYPE deepmem_queue_inflight gauge\n",
            "deepmem_queue_inflight{{queue=\"update\"}} {}\n",
            "deepmem_queue_inflight{{queue=\"forget\"}} {}\n",
            "# TYPE deepmem_queue_failed gauge\n",
            "deepmem_queue_failed{{queue=\"update\"}} {}\n",
            "deepmem_queue_failed{{queue=\"forget\"}} {}\n",
        ),
        state.requests_total.load(Ordering::Relaxed),
        state.started_at.elapsed().as_secs(),
        update.pending_approx,
        forget.pending_approx,
        update.inflight,
        forget.inflight,
        update.failed,
        forget.failed,
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

// ============================================================================
// Queue admin
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FailedQuery {
    pub limit: Option<usize>,
    pub file: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetryBody {
    pub file: Option<String>,
    pub key: Option<String>,
    pub limit: Option<usize>,
    #[serde(default, alias = "dryRun")]
    pub dry_run: bool,
}

const DEFAULT_ADMIN_LIMIT: usize = 50;

fn queue_stats_response(
    state: &SharedState,
    headers: &HeaderMap,
    queue: &Arc<DurableQueue>,
) -> Response {
    if let Err(e) = state.auth.authorize(api_key(headers), Role::Admin) {
        return error_response(&e);
    }
    respond(StatusCode::OK, queue.stats(), None)
}

fn queue_failed_response(
    state: &SharedState,
    headers: &HeaderMap,
    queue: &Arc<DurableQueue>,
    query: &FailedQuery,
) -> Response {
    if let Err(e) = state.auth.authorize(api_key(headers), Role::Admin) {
        return error_response(&e);
    }
    match queue.list_failed(query.limit.unwrap_or(DEFAULT_ADMIN_LIMIT)) {
        Ok(entries) => {
            let tasks: Vec<serde_json::Value> = entries
                .into_iter()
                .map(|(file, task)| json!({ "file": file, "task": task }))
                .collect();
            respond(StatusCode::OK, json!({ "failed": tasks }), None)
        }
        Err(e) => error_response(&e),
    }
}

fn queue_export_response(
    state: &SharedState,
    headers: &HeaderMap,
    queue: &Arc<DurableQueue>,
    query: &FailedQuery,
    audit_action: &str,
) -> Response {
    let ctx = match state.auth.authorize(api_key(headers), Role::Admin) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match queue.export_failed(
        query.file.as_deref(),
        query.key.as_deref(),
        query.limit.unwrap_or(DEFAULT_ADMIN_LIMIT),
    ) {
        Ok(export) => {
            state.audit.append(
                AuditEntry::new(audit_action, &state.config.default_namespace, ctx.audit_key_id())
                    .with_detail(json!({
                        "mode": export.mode,
                        "count": export.tasks.len(),
                        "file": query.file,
                        "key": query.key,
                    })),
            );
            respond(StatusCode::OK, export, None)
        }
        Err(e) => error_response(&e),
    }
}

fn queue_retry_response(
    state: &SharedState,
    headers: &HeaderMap,
    queue: &Arc<DurableQueue>,
    body: &RetryBody,
    audit_action: &str,
) -> Response {
    let ctx = match state.auth.authorize(api_key(headers), Role::Admin) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    let result = if let Some(ref file) = body.file {
        queue
            .retry_failed(file)
            .map(|retried| json!({ "retried": retried, "file": file }))
    } else if let Some(ref key) = body.key {
        queue
            .retry_failed_by_key(key, body.limit.unwrap_or(DEFAULT_ADMIN_LIMIT), body.dry_run)
            .map(|files| json!({ "files": files, "dry_run": body.dry_run }))
    } else {
        Err(DeepMemError::InvalidRequest(
            "file or key is required".into(),
        ))
    };
    match result {
        Ok(value) => {
            state.audit.append(
                AuditEntry::new(audit_action, &state.config.default_namespace, ctx.audit_key_id())
                    .with_dry_run(body.dry_run)
                    .with_detail(value.clone()),
            );
            respond(StatusCode::OK, value, None)
        }
        Err(e) => error_response(&e),
    }
}

pub async fn update_queue_stats(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    queue_stats_response(&state, &headers, &state.update_queue)
}

pub async fn update_queue_failed(
    State(state): State<SharedState>,
    Query(query): Query<FailedQuery>,
    headers: HeaderMap,
) -> Response {
    queue_failed_response(&state, &headers, &state.update_queue, &query)
}

pub async fn update_queue_failed_export(
    State(state): State<SharedState>,
    Query(query): Query<FailedQuery>,
    headers: HeaderMap,
) -> Response {
    queue_export_response(&state, &headers, &state.update_queue, &query, "queue_export")
}

pub async fn update_queue_failed_retry(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: RetryBody = match decode_json(&body, state.guardrails.max_body_bytes) {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };
    queue_retry_response(&state, &headers, &state.update_queue, &body, "queue_retry")
}

pub async fn forget_queue_stats(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    queue_stats_response(&state, &headers, &state.forget_queue)
}

pub async fn forget_queue_failed(
    State(state): State<SharedState>,
    Query(query): Query<FailedQuery>,
    headers: HeaderMap,
) -> Response {
    queue_failed_response(&state, &headers, &state.forget_queue, &query)
}

pub async fn forget_queue_failed_export(
    State(state): State<SharedState>,
    Query(query): Query<FailedQuery>,
    headers: HeaderMap,
) -> Response {
    queue_export_response(
        &state,
        &headers,
        &state.forget_queue,
        &query,
        "forget_queue_export",
    )
}

pub async fn forget_queue_failed_retry(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: RetryBody = match decode_json(&body, state.guardrails.max_body_bytes) {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };
    queue_retry_response(
        &state,
        &headers,
        &state.forget_queue,
        &body,
        "forget_queue_retry",
    )
}
