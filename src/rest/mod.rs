// SPDX-License-Identifier: MIT
// rest/mod.rs — Public REST API server.
//
// Axum HTTP server exposing the scheduler operations under /v1/codeq.
//
// Endpoints:
//   POST /v1/codeq/tasks
//   POST /v1/codeq/tasks/claim
//   POST /v1/codeq/tasks/{id}/heartbeat
//   POST /v1/codeq/tasks/{id}/abandon
//   POST /v1/codeq/tasks/{id}/nack
//   POST /v1/codeq/tasks/{id}/result
//   GET  /v1/codeq/tasks/{id}
//   GET  /v1/codeq/tasks/{id}/result
//   POST /v1/codeq/workers/subscriptions
//   POST /v1/codeq/workers/subscriptions/{id}/heartbeat
//   GET  /v1/codeq/admin/queues
//   GET  /v1/codeq/admin/queues/{command}
//   POST /v1/codeq/admin/tasks/cleanup
//   GET  /healthz
//   GET  /metrics

pub mod auth;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::CoreError;
use crate::AppContext;

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", ctx.config.port).parse()?;
    let router = build_router(ctx);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Liveness + metrics (no auth)
        .route("/healthz", get(routes::health::healthz))
        .route("/metrics", get(routes::health::metrics))
        // Tasks
        .route("/v1/codeq/tasks", post(routes::tasks::create))
        .route("/v1/codeq/tasks/claim", post(routes::tasks::claim))
        .route("/v1/codeq/tasks/{id}", get(routes::tasks::get_task))
        .route("/v1/codeq/tasks/{id}/heartbeat", post(routes::tasks::heartbeat))
        .route("/v1/codeq/tasks/{id}/abandon", post(routes::tasks::abandon))
        .route("/v1/codeq/tasks/{id}/nack", post(routes::tasks::nack))
        .route(
            "/v1/codeq/tasks/{id}/result",
            post(routes::tasks::submit_result).get(routes::tasks::get_result),
        )
        // Worker subscriptions
        .route(
            "/v1/codeq/workers/subscriptions",
            post(routes::workers::create_subscription),
        )
        .route(
            "/v1/codeq/workers/subscriptions/{id}/heartbeat",
            post(routes::workers::heartbeat_subscription),
        )
        // Admin
        .route("/v1/codeq/admin/queues", get(routes::admin::list_queues))
        .route("/v1/codeq/admin/queues/{command}", get(routes::admin::queue_stats))
        .route("/v1/codeq/admin/tasks/cleanup", post(routes::admin::cleanup))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Map a core error onto the HTTP surface.
pub(crate) fn error_response(err: CoreError) -> (StatusCode, Json<Value>) {
    let (status, message) = match &err {
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        CoreError::NotFound(what) => (StatusCode::NOT_FOUND, format!("not found: {what}")),
        CoreError::NotOwner { .. } => (StatusCode::FORBIDDEN, err.to_string()),
        CoreError::NotInProgress { .. } => (StatusCode::CONFLICT, err.to_string()),
        CoreError::IdempotencyConflict(_) => (StatusCode::CONFLICT, err.to_string()),
        CoreError::Storage(msg) => {
            tracing::error!(err = %msg, "storage failure surfaced to client");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
        }
    };
    (status, Json(json!({ "error": message })))
}
