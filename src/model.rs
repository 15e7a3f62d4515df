// SPDX-License-Identifier: MIT
//! Core data model: tasks, results, subscriptions, queue stats.
//!
//! These are both the persisted forms (JSON in the store's hashes) and the
//! wire forms returned over HTTP, so field names are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keyspace;

/// Generate a new task / subscription / notification id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ─── Task ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

/// The authoritative record for a unit of work.
///
/// Owned by the task hash; every queue structure holds only the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// Isolation scope. Empty string selects the legacy single-tenant keys.
    #[serde(default)]
    pub tenant_id: String,
    /// Routing key distinguishing queues of different work types.
    pub command: String,
    /// Opaque JSON payload, stored verbatim.
    pub payload: String,
    /// Clamped to 0..=9; higher wins.
    pub priority: u8,
    pub max_attempts: u32,
    /// Number of deliveries so far. Increments only at claim.
    pub attempts: u32,
    pub status: TaskStatus,
    /// Subject of the lease holder while IN_PROGRESS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// RFC3339 expiry of the current lease while IN_PROGRESS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    /// Result-callback URL, posted to when a result is submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    /// W3C trace context captured at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the task moved to FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Clear ownership fields when the task leaves IN_PROGRESS.
    pub fn clear_lease(&mut self) {
        self.worker_id = None;
        self.lease_until = None;
    }
}

/// Parameters for creating a task. Assembled by the scheduler service from a
/// validated producer request.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub command: String,
    pub payload: String,
    pub priority: u8,
    pub max_attempts: u32,
    pub webhook: Option<String>,
    pub idempotency_key: Option<String>,
    /// Future visibility timestamp; `None` or past means immediate.
    pub visible_at: Option<DateTime<Utc>>,
    pub tenant_id: String,
    pub trace_parent: Option<String>,
    pub trace_state: Option<String>,
}

impl NewTask {
    /// Materialize the task record. Priority is clamped here, on write.
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: new_id(),
            tenant_id: self.tenant_id,
            command: self.command,
            payload: self.payload,
            priority: keyspace::clamp_priority(self.priority as i64),
            max_attempts: self.max_attempts.max(1),
            attempts: 0,
            status: TaskStatus::Pending,
            worker_id: None,
            lease_until: None,
            webhook: self.webhook,
            trace_parent: self.trace_parent,
            trace_state: self.trace_state,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

// ─── Result ───────────────────────────────────────────────────────────────────

/// Named artifact produced by a completed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub url: String,
}

/// Stored independently from the task, keyed by task id. At most one per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    /// COMPLETED or FAILED.
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    pub completed_at: DateTime<Utc>,
}

// ─── Nack ─────────────────────────────────────────────────────────────────────

/// Outcome of a negative acknowledgement.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NackOutcome {
    /// Delay actually applied before the task becomes visible again.
    pub delay_seconds: u64,
    /// True when attempts were exhausted and the task moved to the DLQ.
    pub to_dlq: bool,
}

/// Reason recorded when a nack exhausts the attempt budget.
pub const REASON_MAX_ATTEMPTS: &str = "MAX_ATTEMPTS";
/// Reason used by claim-time repair of expired leases.
pub const REASON_LEASE_EXPIRED: &str = "LEASE_EXPIRED";

// ─── Subscription ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every live subscription whose rate limit permits.
    Fanout,
    /// One subscription per groupId, rotated round-robin.
    Group,
    /// One deterministic selection per time window.
    Hash,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Fanout
    }
}

/// A worker-availability subscription. Live iff `expires_at > now`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub callback_url: String,
    pub event_types: Vec<String>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Minimum seconds between notifications to this subscription.
    #[serde(default)]
    pub min_interval_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ─── Stats ────────────────────────────────────────────────────────────────────

/// Aggregate depths for one (command, tenant) queue. Best-effort reads.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Sum of pending-list lengths across all priority tiers.
    pub ready: u64,
    pub delayed: u64,
    pub in_progress: u64,
    pub dlq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_json_round_trips_with_camel_case() {
        let now = Utc::now();
        let task = NewTask {
            command: "PROCESS_ORDER".into(),
            payload: r#"{"orderId":"o-1"}"#.into(),
            priority: 5,
            max_attempts: 3,
            tenant_id: "acme".into(),
            ..Default::default()
        }
        .into_task(now);

        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"tenantId\":\"acme\""));
        assert!(json.contains("\"maxAttempts\":3"));
        assert!(json.contains("\"status\":\"PENDING\""));
        // Unset lease fields stay off the wire entirely.
        assert!(!json.contains("workerId"));

        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.priority, 5);
        assert_eq!(back.status, TaskStatus::Pending);
    }

    #[test]
    fn into_task_clamps_priority_and_attempts() {
        let task = NewTask {
            command: "x".into(),
            priority: 200,
            max_attempts: 0,
            ..Default::default()
        }
        .into_task(Utc::now());
        assert_eq!(task.priority, 9);
        assert_eq!(task.max_attempts, 1);
    }

    #[test]
    fn delivery_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&DeliveryMode::Fanout).unwrap(), "\"fanout\"");
        assert_eq!(
            serde_json::from_str::<DeliveryMode>("\"group\"").unwrap(),
            DeliveryMode::Group
        );
    }
}
