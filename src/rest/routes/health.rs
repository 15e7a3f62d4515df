// rest/routes/health.rs — Liveness and metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::AppContext;

pub async fn healthz(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, StatusCode> {
    if let Some(store) = &ctx.store {
        if store.ping().await.is_err() {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    }
    Ok(Json(json!({
        "status": "ok",
        "uptimeSeconds": ctx.started_at.elapsed().as_secs(),
    })))
}

pub async fn metrics(State(ctx): State<Arc<AppContext>>) -> String {
    ctx.metrics.render_prometheus()
}
