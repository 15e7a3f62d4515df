// SPDX-License-Identifier: MIT
// rest/routes/workers.rs — Worker-availability subscription routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::identity;
use crate::model::DeliveryMode;
use crate::rest::{auth, error_response};
use crate::subscriptions::{build_subscription, NewSubscription};
use crate::AppContext;

type HandlerError = (StatusCode, Json<Value>);

const DEFAULT_TTL_SECONDS: u64 = 300;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionBody {
    pub callback_url: String,
    #[serde(default)]
    pub event_types: Vec<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub group_id: Option<String>,
    #[serde(default)]
    pub min_interval_seconds: u64,
    pub ttl_seconds: Option<u64>,
}

pub async fn create_subscription(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateSubscriptionBody>,
) -> Result<Json<Value>, HandlerError> {
    let caller = auth::require_scope(&ctx, &headers, identity::SCOPE_SUBSCRIBE)?;

    for event in &body.event_types {
        if !caller.may_subscribe(event) {
            return Err((
                StatusCode::FORBIDDEN,
                Json(json!({ "error": format!("not allowed to subscribe to '{event}'") })),
            ));
        }
    }

    let sub = build_subscription(
        NewSubscription {
            callback_url: body.callback_url,
            event_types: body.event_types,
            delivery_mode: body.delivery_mode,
            group_id: body.group_id,
            min_interval_seconds: body.min_interval_seconds,
            ttl_seconds: body.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS),
        },
        Utc::now(),
    )
    .map_err(error_response)?;

    let sub = ctx
        .subscriptions
        .create(sub)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(sub).unwrap_or_default()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionHeartbeatBody {
    pub ttl_seconds: Option<u64>,
}

pub async fn heartbeat_subscription(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<SubscriptionHeartbeatBody>>,
) -> Result<Json<Value>, HandlerError> {
    auth::require_scope(&ctx, &headers, identity::SCOPE_SUBSCRIBE)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let sub = ctx
        .subscriptions
        .heartbeat(&id, body.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS))
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "id": sub.id,
        "expiresAt": sub.expires_at,
    })))
}
