// SPDX-License-Identifier: MIT
// rest/routes/tasks.rs — Task lifecycle routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::identity;
use crate::model::{Artifact, TaskStatus};
use crate::rest::{auth, error_response};
use crate::scheduler::{ClaimTaskRequest, CreateTaskRequest, SubmitResultRequest};
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

// ─── Create ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskBody {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    pub priority: Option<i64>,
    pub max_attempts: Option<u32>,
    pub webhook: Option<String>,
    pub idempotency_key: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub delay_seconds: Option<u64>,
}

pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    let caller = auth::authenticate(&ctx, &headers)?;

    let req = CreateTaskRequest {
        command: body.command,
        payload: body.payload,
        priority: body.priority,
        max_attempts: body.max_attempts,
        webhook: body.webhook,
        idempotency_key: body.idempotency_key,
        run_at: body.run_at,
        delay_seconds: body.delay_seconds,
        tenant_id: caller.tenant_id,
        trace_parent: header(&headers, "traceparent"),
        trace_state: header(&headers, "tracestate"),
    };

    let (task, created) = ctx.scheduler.create_task(req).await.map_err(error_response)?;
    let status = if created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK // idempotency key resolved to an existing task
    };
    Ok((status, Json(serde_json::to_value(task).unwrap_or_default())))
}

// ─── Claim ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBody {
    #[serde(default)]
    pub commands: Vec<String>,
    pub lease_seconds: Option<u64>,
    pub wait_seconds: Option<u64>,
}

pub async fn claim(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Option<Json<ClaimBody>>,
) -> Result<Response, HandlerError> {
    let caller = auth::require_scope(&ctx, &headers, identity::SCOPE_CLAIM)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let req = ClaimTaskRequest {
        worker_id: caller.subject,
        commands: body.commands,
        lease_seconds: body.lease_seconds,
        wait_seconds: body.wait_seconds,
        tenant_id: caller.tenant_id,
    };

    match ctx.scheduler.claim_task(req).await.map_err(error_response)? {
        Some(task) => Ok((
            StatusCode::OK,
            Json(serde_json::to_value(task).unwrap_or_default()),
        )
            .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

// ─── Lease maintenance ────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody {
    pub extend_seconds: Option<u64>,
}

pub async fn heartbeat(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<HeartbeatBody>>,
) -> Result<Json<Value>, HandlerError> {
    let caller = auth::require_scope(&ctx, &headers, identity::SCOPE_HEARTBEAT)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let task = ctx
        .scheduler
        .heartbeat(&id, &caller.subject, body.extend_seconds)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "taskId": task.id,
        "leaseUntil": task.lease_until,
    })))
}

pub async fn abandon(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    let caller = auth::require_scope(&ctx, &headers, identity::SCOPE_ABANDON)?;
    ctx.scheduler
        .abandon(&id, &caller.subject)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "taskId": id, "status": "PENDING" })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NackBody {
    pub delay_seconds: Option<u64>,
}

pub async fn nack(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<NackBody>>,
) -> Result<Json<Value>, HandlerError> {
    let caller = auth::require_scope(&ctx, &headers, identity::SCOPE_NACK)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let outcome = ctx
        .scheduler
        .nack_task(&id, &caller.subject, body.delay_seconds)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "status": if outcome.to_dlq { "FAILED" } else { "PENDING" },
        "delaySeconds": outcome.delay_seconds,
    })))
}

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBody {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

pub async fn submit_result(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ResultBody>,
) -> Result<Json<Value>, HandlerError> {
    let caller = auth::require_scope(&ctx, &headers, identity::SCOPE_RESULT)?;

    let result = ctx
        .scheduler
        .submit_result(
            &id,
            SubmitResultRequest {
                worker_id: caller.subject,
                status: body.status,
                result: body.result,
                error: body.error,
                artifacts: body.artifacts,
            },
        )
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

// ─── Reads ────────────────────────────────────────────────────────────────────

pub async fn get_task(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    auth::authenticate(&ctx, &headers)?;
    let task = ctx.scheduler.get_task(&id).await.map_err(error_response)?;
    Ok(Json(serde_json::to_value(task).unwrap_or_default()))
}

pub async fn get_result(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    auth::authenticate(&ctx, &headers)?;
    let (task, result) = ctx
        .scheduler
        .task_with_result(&id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "task": task, "result": result })))
}
