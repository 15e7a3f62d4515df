// SPDX-License-Identifier: MIT
//! In-memory task repository.
//!
//! One mutex over native structures, mirroring the store-backed semantics
//! transition for transition: per-tier deques, an in-progress set, a delayed
//! set ordered by (score, insertion), a DLQ set, and wall-clock leases.
//! Backs the unit and integration suites; also usable as a single-process
//! scheduler for local development.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::keyspace::MAX_PRIORITY;
use crate::metrics::{CoreMetrics, SharedMetrics};
use crate::model::{
    NackOutcome, NewTask, QueueStats, Task, TaskResult, TaskStatus, REASON_LEASE_EXPIRED,
    REASON_MAX_ATTEMPTS,
};

use super::{ClaimRequest, EnqueueOutcome, ResultSubmission, TaskRepository};

const TIERS: usize = MAX_PRIORITY as usize + 1;

/// (command, tenant)
type QueueKey = (String, String);

struct MemIdempotency {
    task_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemQueue {
    /// front = newest, back = oldest (claim pops from the back).
    pending: [VecDeque<String>; TIERS],
    in_progress: HashSet<String>,
    /// Ordered by (visibility epoch, insertion seq) — promotion order.
    delayed: BTreeSet<(i64, u64, String)>,
    dlq: HashSet<String>,
}

impl MemQueue {
    fn pending_depth(&self) -> u64 {
        self.pending.iter().map(|t| t.len() as u64).sum()
    }

    fn remove_pending(&mut self, id: &str) {
        for tier in &mut self.pending {
            tier.retain(|x| x != id);
        }
    }

    fn remove_delayed(&mut self, id: &str) {
        let entries: Vec<_> = self
            .delayed
            .iter()
            .filter(|(_, _, x)| x == id)
            .cloned()
            .collect();
        for entry in entries {
            self.delayed.remove(&entry);
        }
    }
}

#[derive(Default)]
struct MemInner {
    tasks: HashMap<String, Task>,
    results: HashMap<String, TaskResult>,
    /// task id → retention cutoff (epoch seconds).
    retention: HashMap<String, i64>,
    /// task id → lease expiry. Ownership itself lives on the task record.
    leases: HashMap<String, DateTime<Utc>>,
    queues: HashMap<QueueKey, MemQueue>,
    idempotency: HashMap<String, MemIdempotency>,
    commands: BTreeSet<String>,
    delayed_seq: u64,
}

impl MemInner {
    fn queue_mut(&mut self, command: &str, tenant_id: &str) -> &mut MemQueue {
        self.queues
            .entry((command.to_string(), tenant_id.to_string()))
            .or_default()
    }

    fn bump_retention(&mut self, task_id: &str, now: DateTime<Utc>, retention_seconds: u64) {
        self.retention
            .insert(task_id.to_string(), now.timestamp() + retention_seconds as i64);
    }

    /// Promote due delayed entries for one zset into their pending tiers.
    fn promote_due(&mut self, command: &str, zset_tenant: &str, now: DateTime<Utc>, limit: usize) {
        let key = (command.to_string(), zset_tenant.to_string());
        let due: Vec<(i64, u64, String)> = match self.queues.get(&key) {
            Some(queue) => queue
                .delayed
                .iter()
                .take_while(|(score, _, _)| *score <= now.timestamp())
                .take(limit)
                .cloned()
                .collect(),
            None => return,
        };

        for entry in due {
            self.queues
                .get_mut(&key)
                .expect("queue exists")
                .delayed
                .remove(&entry);
            let id = entry.2;
            let Some(task) = self.tasks.get(&id).cloned() else {
                continue; // record gone — entry dropped
            };
            // The pending tier comes from the task's own tenant.
            let target = self.queue_mut(&task.command, &task.tenant_id);
            target.pending[task.priority as usize].push_front(id);
        }
    }

    /// Shared nack transition. `worker_id` empty skips the owner check.
    #[allow(clippy::too_many_arguments)]
    fn nack_locked(
        &mut self,
        task_id: &str,
        worker_id: &str,
        delay_seconds: u64,
        max_attempts_default: u32,
        reason: &str,
        now: DateTime<Utc>,
        retention_seconds: u64,
        metrics: &CoreMetrics,
    ) -> CoreResult<NackOutcome> {
        let mut task = self
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(task_id.to_string()))?;

        if task.status != TaskStatus::InProgress {
            return Err(CoreError::NotInProgress {
                task_id: task_id.to_string(),
            });
        }
        if !worker_id.is_empty() && task.worker_id.as_deref() != Some(worker_id) {
            return Err(CoreError::NotOwner {
                task_id: task_id.to_string(),
            });
        }

        let effective_max = if task.max_attempts > 0 {
            task.max_attempts
        } else {
            max_attempts_default
        };

        let queue_key = (task.command.clone(), task.tenant_id.clone());
        let outcome = if task.attempts >= effective_max {
            task.status = TaskStatus::Failed;
            task.error = Some(if reason.is_empty() {
                REASON_MAX_ATTEMPTS.to_string()
            } else {
                reason.to_string()
            });
            task.clear_lease();
            let queue = self.queues.entry(queue_key).or_default();
            queue.in_progress.remove(task_id);
            queue.dlq.insert(task_id.to_string());
            metrics.inc_tasks_failed();
            let elapsed = (now - task.created_at).num_milliseconds();
            metrics
                .processing_latency
                .observe((elapsed.max(0) as f64) / 1000.0);
            NackOutcome {
                delay_seconds: 0,
                to_dlq: true,
            }
        } else {
            task.status = TaskStatus::Pending;
            task.clear_lease();
            let seq = self.delayed_seq;
            self.delayed_seq += 1;
            let priority = task.priority as usize;
            let queue = self.queues.entry(queue_key).or_default();
            queue.in_progress.remove(task_id);
            if delay_seconds == 0 {
                queue.pending[priority].push_front(task_id.to_string());
            } else {
                queue.delayed.insert((
                    now.timestamp() + delay_seconds as i64,
                    seq,
                    task_id.to_string(),
                ));
            }
            NackOutcome {
                delay_seconds,
                to_dlq: false,
            }
        };

        self.leases.remove(task_id);
        task.updated_at = now;
        self.tasks.insert(task_id.to_string(), task);
        self.bump_retention(task_id, now, retention_seconds);
        Ok(outcome)
    }
}

pub struct MemoryRepository {
    retention_seconds: u64,
    metrics: SharedMetrics,
    inner: Mutex<MemInner>,
}

impl MemoryRepository {
    pub fn new(retention_seconds: u64) -> Self {
        Self {
            retention_seconds,
            metrics: std::sync::Arc::new(CoreMetrics::new()),
            inner: Mutex::new(MemInner::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new(24 * 60 * 60)
    }
}

#[async_trait]
impl TaskRepository for MemoryRepository {
    async fn enqueue(&self, new: NewTask) -> CoreResult<EnqueueOutcome> {
        if new.command.trim().is_empty() {
            return Err(CoreError::validation("command must not be blank"));
        }
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let visible_at = new.visible_at;
        let idempotency_key = new.idempotency_key.clone().filter(|k| !k.is_empty());

        if let Some(key) = &idempotency_key {
            let hit = inner.idempotency.get(key).and_then(|entry| {
                (entry.expires_at > now).then(|| entry.task_id.clone())
            });
            if let Some(existing_id) = hit {
                if let Some(existing) = inner.tasks.get(&existing_id).cloned() {
                    return Ok(EnqueueOutcome {
                        task: existing,
                        created: false,
                        pending_depth: None,
                    });
                }
                inner.idempotency.remove(key); // stale mapping
            }
        }

        let task = new.into_task(now);
        inner.tasks.insert(task.id.clone(), task.clone());
        inner.bump_retention(&task.id, now, self.retention_seconds);
        inner.commands.insert(task.command.clone());

        if let Some(key) = idempotency_key {
            inner.idempotency.insert(
                key,
                MemIdempotency {
                    task_id: task.id.clone(),
                    expires_at: now + Duration::seconds(self.retention_seconds as i64),
                },
            );
        }

        let pending_depth = if let Some(at) = visible_at.filter(|at| *at > now) {
            let seq = inner.delayed_seq;
            inner.delayed_seq += 1;
            let queue = inner.queue_mut(&task.command, &task.tenant_id);
            queue.delayed.insert((at.timestamp(), seq, task.id.clone()));
            None
        } else {
            let queue = inner.queue_mut(&task.command, &task.tenant_id);
            queue.pending[task.priority as usize].push_front(task.id.clone());
            Some(queue.pending_depth())
        };

        Ok(EnqueueOutcome {
            task,
            created: true,
            pending_depth,
        })
    }

    async fn get_task(&self, task_id: &str) -> CoreResult<Task> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(task_id.to_string()))
    }

    async fn claim(&self, req: &ClaimRequest) -> CoreResult<Option<Task>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        for command in &req.commands {
            inner.promote_due(command, &req.tenant_id, now, req.inspect_limit);
            if !req.tenant_id.is_empty() {
                inner.promote_due(command, "", now, req.inspect_limit);
            }

            // Expired-lease repair: sample the in-progress set, nack lapsed
            // leases with zero delay so the sweep below can pick them up.
            let key = (command.clone(), req.tenant_id.clone());
            let sample: Vec<String> = match inner.queues.get(&key) {
                Some(queue) => queue
                    .in_progress
                    .iter()
                    .take(req.inspect_limit)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            for id in sample {
                let expired = match inner.leases.get(&id) {
                    Some(expires_at) => *expires_at <= now,
                    None => true,
                };
                if !expired {
                    continue;
                }
                match inner.nack_locked(
                    &id,
                    "",
                    0,
                    req.max_attempts_default,
                    REASON_LEASE_EXPIRED,
                    now,
                    self.retention_seconds,
                    &self.metrics,
                ) {
                    Ok(_) => self.metrics.inc_leases_expired(),
                    Err(CoreError::NotInProgress { .. }) => {}
                    Err(CoreError::NotFound(_)) => {
                        if let Some(queue) = inner.queues.get_mut(&key) {
                            queue.in_progress.remove(&id);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        for command in &req.commands {
            let key = (command.clone(), req.tenant_id.clone());
            for priority in (0..TIERS).rev() {
                for _ in 0..req.inspect_limit.max(1) {
                    let popped = match inner.queues.get_mut(&key) {
                        Some(queue) => match queue.pending[priority].pop_back() {
                            Some(id) => {
                                if !queue.in_progress.insert(id.clone()) {
                                    continue; // stale duplicate reference
                                }
                                id
                            }
                            None => break,
                        },
                        None => break,
                    };

                    let Some(mut task) = inner.tasks.get(&popped).cloned() else {
                        // Ghost: record deleted while still queued.
                        if let Some(queue) = inner.queues.get_mut(&key) {
                            queue.in_progress.remove(&popped);
                        }
                        continue;
                    };

                    inner
                        .leases
                        .insert(popped.clone(), now + Duration::seconds(req.lease_seconds as i64));
                    task.status = TaskStatus::InProgress;
                    task.worker_id = Some(req.worker_id.clone());
                    task.lease_until = Some(now + Duration::seconds(req.lease_seconds as i64));
                    task.attempts += 1;
                    task.updated_at = now;
                    inner.tasks.insert(popped.clone(), task.clone());
                    inner.bump_retention(&popped, now, self.retention_seconds);
                    return Ok(Some(task));
                }
            }
        }
        Ok(None)
    }

    async fn heartbeat(
        &self,
        task_id: &str,
        worker_id: &str,
        extend_seconds: u64,
    ) -> CoreResult<Task> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut task = inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(task_id.to_string()))?;

        if task.worker_id.as_deref() != Some(worker_id) {
            return Err(CoreError::NotOwner {
                task_id: task_id.to_string(),
            });
        }
        if task.status != TaskStatus::InProgress {
            return Err(CoreError::NotInProgress {
                task_id: task_id.to_string(),
            });
        }

        inner
            .leases
            .insert(task_id.to_string(), now + Duration::seconds(extend_seconds as i64));
        task.lease_until = Some(now + Duration::seconds(extend_seconds as i64));
        task.updated_at = now;
        inner.tasks.insert(task_id.to_string(), task.clone());
        inner.bump_retention(task_id, now, self.retention_seconds);
        Ok(task)
    }

    async fn abandon(&self, task_id: &str, worker_id: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut task = inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(task_id.to_string()))?;

        if task.worker_id.as_deref() != Some(worker_id) {
            return Err(CoreError::NotOwner {
                task_id: task_id.to_string(),
            });
        }
        if task.status != TaskStatus::InProgress {
            return Err(CoreError::NotInProgress {
                task_id: task_id.to_string(),
            });
        }

        task.status = TaskStatus::Pending;
        task.clear_lease();
        task.updated_at = now;
        let priority = task.priority as usize;
        let queue = inner.queue_mut(&task.command, &task.tenant_id);
        queue.in_progress.remove(task_id);
        queue.pending[priority].push_front(task_id.to_string());
        inner.leases.remove(task_id);
        inner.tasks.insert(task_id.to_string(), task);
        inner.bump_retention(task_id, now, self.retention_seconds);
        Ok(())
    }

    async fn nack(
        &self,
        task_id: &str,
        worker_id: &str,
        delay_seconds: u64,
        max_attempts_default: u32,
        reason: &str,
    ) -> CoreResult<NackOutcome> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        inner.nack_locked(
            task_id,
            worker_id,
            delay_seconds,
            max_attempts_default,
            reason,
            now,
            self.retention_seconds,
            &self.metrics,
        )
    }

    async fn submit_result(
        &self,
        task_id: &str,
        submission: ResultSubmission,
    ) -> CoreResult<(Task, TaskResult)> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut task = inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(task_id.to_string()))?;

        if task.status != TaskStatus::InProgress {
            return Err(CoreError::NotInProgress {
                task_id: task_id.to_string(),
            });
        }
        if task.worker_id.as_deref() != Some(submission.worker_id.as_str()) {
            return Err(CoreError::NotOwner {
                task_id: task_id.to_string(),
            });
        }

        let result = TaskResult {
            task_id: task_id.to_string(),
            status: submission.status,
            result: submission.result,
            error: submission.error.clone(),
            artifacts: submission.artifacts,
            completed_at: now,
        };

        task.status = submission.status;
        if submission.status == TaskStatus::Failed {
            task.error = submission.error;
        }
        task.clear_lease();
        task.updated_at = now;

        let queue = inner.queue_mut(&task.command, &task.tenant_id);
        queue.in_progress.remove(task_id);
        inner.leases.remove(task_id);
        inner.results.insert(task_id.to_string(), result.clone());
        inner.tasks.insert(task_id.to_string(), task.clone());
        inner.bump_retention(task_id, now, self.retention_seconds);
        Ok((task, result))
    }

    async fn get_result(&self, task_id: &str) -> CoreResult<Option<TaskResult>> {
        let inner = self.inner.lock().await;
        Ok(inner.results.get(task_id).cloned())
    }

    async fn move_due_delayed(
        &self,
        command: &str,
        tenant_id: &str,
        limit: usize,
    ) -> CoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let before = inner
            .queues
            .get(&(command.to_string(), tenant_id.to_string()))
            .map(|q| q.delayed.len())
            .unwrap_or(0);
        inner.promote_due(command, tenant_id, now, limit);
        let after = inner
            .queues
            .get(&(command.to_string(), tenant_id.to_string()))
            .map(|q| q.delayed.len())
            .unwrap_or(0);
        Ok((before - after) as u64)
    }

    async fn cleanup_expired(&self, limit: usize, before: DateTime<Utc>) -> CoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let cutoff = before.timestamp();
        let expired: Vec<String> = inner
            .retention
            .iter()
            .filter(|(_, score)| **score <= cutoff)
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect();

        let mut deleted = 0u64;
        for id in expired {
            let task = inner.tasks.remove(&id);
            inner.results.remove(&id);
            inner.retention.remove(&id);
            inner.leases.remove(&id);
            match task {
                Some(task) => {
                    let queue = inner.queue_mut(&task.command, &task.tenant_id);
                    queue.remove_pending(&id);
                    queue.in_progress.remove(&id);
                    queue.remove_delayed(&id);
                    queue.dlq.remove(&id);
                    if !task.tenant_id.is_empty() {
                        let legacy = inner.queue_mut(&task.command, "");
                        legacy.remove_delayed(&id);
                    }
                }
                None => {
                    // Best-effort sweep across empty-tenant queues only —
                    // tenant-scoped orphans wait for a future pass.
                    for queue in inner
                        .queues
                        .iter_mut()
                        .filter(|((_, tenant), _)| tenant.is_empty())
                        .map(|(_, q)| q)
                    {
                        queue.remove_pending(&id);
                        queue.in_progress.remove(&id);
                        queue.remove_delayed(&id);
                        queue.dlq.remove(&id);
                    }
                }
            }
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn queue_stats(&self, command: &str, tenant_id: &str) -> CoreResult<QueueStats> {
        let inner = self.inner.lock().await;
        let stats = inner
            .queues
            .get(&(command.to_string(), tenant_id.to_string()))
            .map(|queue| QueueStats {
                ready: queue.pending_depth(),
                delayed: queue.delayed.len() as u64,
                in_progress: queue.in_progress.len() as u64,
                dlq: queue.dlq.len() as u64,
            })
            .unwrap_or_default();
        Ok(stats)
    }

    async fn known_commands(&self) -> CoreResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.commands.iter().cloned().collect())
    }
}
