// SPDX-License-Identifier: MIT
//! Task repository — the single persistence interface of the scheduler core.
//!
//! All queue transitions live behind [`TaskRepository`] so backends are
//! drop-in: the store-backed implementation in [`redis`] is the production
//! path, the mutex-guarded one in [`memory`] backs the test suites.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::model::{NackOutcome, NewTask, QueueStats, Task, TaskResult};

/// What enqueue did, and where the task landed.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub task: Task,
    /// False when an idempotency key resolved to an existing task.
    pub created: bool,
    /// Total pending depth of the (tenant, command) queue right after an
    /// immediate placement; `None` for delayed placement or an idempotent hit.
    pub pending_depth: Option<u64>,
}

impl EnqueueOutcome {
    /// True when this enqueue made an empty queue non-empty — the trigger
    /// for a worker-availability notification.
    pub fn became_non_empty(&self) -> bool {
        self.created && self.pending_depth == Some(1)
    }
}

/// One claim attempt by a worker.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Lease owner subject. Never empty.
    pub worker_id: String,
    /// Commands to scan, in caller priority order.
    pub commands: Vec<String>,
    pub tenant_id: String,
    pub lease_seconds: u64,
    /// Budget for the claim-move inner loop, the ghost-skip loop, and the
    /// expired-lease repair sample — one claim does O(inspect_limit) work.
    pub inspect_limit: usize,
    /// Fallback when a task record carries no max-attempts of its own.
    pub max_attempts_default: u32,
}

/// A worker's submitted completion (or failure) for a leased task.
#[derive(Debug, Clone)]
pub struct ResultSubmission {
    pub worker_id: String,
    pub status: crate::model::TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub artifacts: Vec<crate::model::Artifact>,
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create (or idempotently resolve) a task and place it for execution.
    async fn enqueue(&self, new: NewTask) -> CoreResult<EnqueueOutcome>;

    async fn get_task(&self, task_id: &str) -> CoreResult<Task>;

    /// Claim the next eligible task: promote due delayed entries, repair
    /// expired leases, then walk commands (caller order) and priorities
    /// (9 → 0). `None` when every scanned queue is empty.
    async fn claim(&self, req: &ClaimRequest) -> CoreResult<Option<Task>>;

    /// Extend the caller's lease. Owner-only.
    async fn heartbeat(
        &self,
        task_id: &str,
        worker_id: &str,
        extend_seconds: u64,
    ) -> CoreResult<Task>;

    /// Return a leased task to its pending tier without consuming an attempt.
    /// Owner-only.
    async fn abandon(&self, task_id: &str, worker_id: &str) -> CoreResult<()>;

    /// Negative-acknowledge a leased task: delayed retry after
    /// `delay_seconds`, or dead-letter when attempts are exhausted. An empty
    /// `worker_id` skips the owner check (repair path).
    async fn nack(
        &self,
        task_id: &str,
        worker_id: &str,
        delay_seconds: u64,
        max_attempts_default: u32,
        reason: &str,
    ) -> CoreResult<NackOutcome>;

    /// Record the task's result and finish it. At most once per task; a
    /// second submission fails with not-in-progress.
    async fn submit_result(
        &self,
        task_id: &str,
        submission: ResultSubmission,
    ) -> CoreResult<(Task, TaskResult)>;

    async fn get_result(&self, task_id: &str) -> CoreResult<Option<TaskResult>>;

    /// Promote delayed entries with score ≤ now into their pending tiers.
    /// Returns how many moved.
    async fn move_due_delayed(
        &self,
        command: &str,
        tenant_id: &str,
        limit: usize,
    ) -> CoreResult<u64>;

    /// Remove up to `limit` records whose retention cutoff is ≤ `before`,
    /// defensively clearing every structure that might reference them.
    async fn cleanup_expired(&self, limit: usize, before: DateTime<Utc>) -> CoreResult<u64>;

    /// Best-effort depth aggregation for one (command, tenant).
    async fn queue_stats(&self, command: &str, tenant_id: &str) -> CoreResult<QueueStats>;

    /// Every command ever enqueued.
    async fn known_commands(&self) -> CoreResult<Vec<String>>;
}
