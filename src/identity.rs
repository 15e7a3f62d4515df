// SPDX-License-Identifier: MIT
//! Caller identity as consumed by the core.
//!
//! How the identity is obtained (bearer tokens, mTLS, …) is the transport's
//! business; the core only ever sees this struct.

use serde::{Deserialize, Serialize};

pub const SCOPE_CLAIM: &str = "codeq:claim";
pub const SCOPE_HEARTBEAT: &str = "codeq:heartbeat";
pub const SCOPE_ABANDON: &str = "codeq:abandon";
pub const SCOPE_NACK: &str = "codeq:nack";
pub const SCOPE_RESULT: &str = "codeq:result";
pub const SCOPE_SUBSCRIBE: &str = "codeq:subscribe";
pub const SCOPE_ADMIN: &str = "codeq:admin";

/// Subject, scopes, subscribable event types, and tenant of a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject — doubles as the worker id for lease ownership.
    pub subject: String,
    pub scopes: Vec<String>,
    /// Event types this identity may subscribe to. Empty = any.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Isolation scope; empty selects the legacy single-tenant keyspace.
    #[serde(default)]
    pub tenant_id: String,
}

impl Identity {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn is_admin(&self) -> bool {
        self.has_scope(SCOPE_ADMIN)
    }

    /// Whether this identity may subscribe to `event_type`.
    pub fn may_subscribe(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|e| e == event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_checks() {
        let id = Identity {
            subject: "worker-7".into(),
            scopes: vec![SCOPE_CLAIM.into(), SCOPE_RESULT.into()],
            event_types: vec!["PROCESS_ORDER".into()],
            tenant_id: "acme".into(),
        };
        assert!(id.has_scope(SCOPE_CLAIM));
        assert!(!id.has_scope(SCOPE_ADMIN));
        assert!(!id.is_admin());
        assert!(id.may_subscribe("PROCESS_ORDER"));
        assert!(!id.may_subscribe("OTHER"));
    }

    #[test]
    fn empty_event_types_allows_any() {
        let id = Identity::default();
        assert!(id.may_subscribe("anything"));
    }
}
