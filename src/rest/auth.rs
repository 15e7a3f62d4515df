// SPDX-License-Identifier: MIT
//! Bearer-token resolution.
//!
//! The REST layer resolves `Authorization: Bearer <token>` against the
//! statically configured tokens and hands the core an [`Identity`]. 401 for
//! a missing or unknown token, 403 for a missing scope.

use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use crate::identity::Identity;
use crate::AppContext;

pub type AuthRejection = (StatusCode, Json<Value>);

fn unauthorized(message: &str) -> AuthRejection {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message })))
}

fn forbidden(message: &str) -> AuthRejection {
    (StatusCode::FORBIDDEN, Json(json!({ "error": message })))
}

/// Resolve the caller's identity from the request headers.
pub fn authenticate(ctx: &AppContext, headers: &HeaderMap) -> Result<Identity, AuthRejection> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("missing Authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized("Authorization header must be a bearer token"))?;

    ctx.config
        .auth_tokens
        .iter()
        .find(|t| t.token == token)
        .map(|t| Identity {
            subject: t.subject.clone(),
            scopes: t.scopes.clone(),
            event_types: t.event_types.clone(),
            tenant_id: t.tenant_id.clone(),
        })
        .ok_or_else(|| unauthorized("unknown token"))
}

/// Authenticate and require one scope.
pub fn require_scope(
    ctx: &AppContext,
    headers: &HeaderMap,
    scope: &str,
) -> Result<Identity, AuthRejection> {
    let identity = authenticate(ctx, headers)?;
    if !identity.has_scope(scope) {
        return Err(forbidden(&format!("missing scope {scope}")));
    }
    Ok(identity)
}

/// Authenticate and require the admin scope.
pub fn require_admin(ctx: &AppContext, headers: &HeaderMap) -> Result<Identity, AuthRejection> {
    let identity = authenticate(ctx, headers)?;
    if !identity.is_admin() {
        return Err(forbidden("admin scope required"));
    }
    Ok(identity)
}
