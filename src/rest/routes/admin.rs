// SPDX-License-Identifier: MIT
// rest/routes/admin.rs — Operator routes: queue depths, retention sweep.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::rest::{auth, error_response};
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

pub async fn list_queues(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    let caller = auth::require_admin(&ctx, &headers)?;
    let queues = ctx
        .scheduler
        .admin_queues(&caller.tenant_id)
        .await
        .map_err(error_response)?;

    let list: Vec<Value> = queues
        .into_iter()
        .map(|(command, stats)| json!({ "command": command, "stats": stats }))
        .collect();
    Ok(Json(json!({ "queues": list })))
}

pub async fn queue_stats(
    State(ctx): State<Arc<AppContext>>,
    Path(command): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    let caller = auth::require_admin(&ctx, &headers)?;
    let stats = ctx
        .scheduler
        .queue_stats(&command, &caller.tenant_id)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupBody {
    pub limit: Option<usize>,
    pub before: Option<DateTime<Utc>>,
}

pub async fn cleanup(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Option<Json<CleanupBody>>,
) -> Result<Json<Value>, HandlerError> {
    auth::require_admin(&ctx, &headers)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let outcome = ctx
        .scheduler
        .cleanup_expired(body.limit, body.before)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}
