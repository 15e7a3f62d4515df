// SPDX-License-Identifier: MIT
//! Store-backed task repository.
//!
//! Every transition is a single script or an atomic pipeline over the keys of
//! one (tenant, command) queue; cross-queue atomicity is never required.
//! Partial failures during lease acquisition unwind by returning the id to
//! the pending tail it was popped from.

use std::sync::Arc;

use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::bloom::RotatingBloom;
use crate::error::{CoreError, CoreResult};
use crate::keyspace::{self, MAX_PRIORITY};
use crate::metrics::{CoreMetrics, SharedMetrics};
use crate::model::{
    NackOutcome, NewTask, QueueStats, Task, TaskResult, TaskStatus, REASON_LEASE_EXPIRED,
    REASON_MAX_ATTEMPTS,
};
use crate::store::{scripts, Store};

use super::{ClaimRequest, EnqueueOutcome, ResultSubmission, TaskRepository};

pub struct RedisRepository {
    store: Store,
    /// Logical retention window; every mutation bumps the retention score
    /// this far into the future.
    retention_seconds: u64,
    /// Accelerates negative lookups for fresh idempotency keys.
    idempo_filter: Arc<RotatingBloom>,
    /// Shortcuts ids whose task hash was removed by admin cleanup.
    ghost_filter: Arc<RotatingBloom>,
    metrics: SharedMetrics,
}

impl RedisRepository {
    pub fn new(store: Store, retention_seconds: u64) -> Self {
        Self {
            store,
            retention_seconds,
            idempo_filter: Arc::new(RotatingBloom::with_defaults()),
            ghost_filter: Arc::new(RotatingBloom::with_defaults()),
            metrics: Arc::new(CoreMetrics::new()),
        }
    }

    pub fn with_filters(
        mut self,
        idempo_filter: Arc<RotatingBloom>,
        ghost_filter: Arc<RotatingBloom>,
    ) -> Self {
        self.idempo_filter = idempo_filter;
        self.ghost_filter = ghost_filter;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    fn retention_cutoff(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() + self.retention_seconds as i64
    }

    async fn load_task(
        &self,
        conn: &mut MultiplexedConnection,
        task_id: &str,
    ) -> CoreResult<Option<Task>> {
        let raw: Option<String> = conn.hget(keyspace::tasks_hash(), task_id).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Rewrite the task record and bump retention in one transaction.
    async fn save_task(
        &self,
        conn: &mut MultiplexedConnection,
        task: &Task,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let json = serde_json::to_string(task)?;
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        pipe.hset(keyspace::tasks_hash(), &task.id, json).ignore();
        pipe.zadd(keyspace::retention_zset(), &task.id, self.retention_cutoff(now))
            .ignore();
        let _: () = pipe.query_async(conn).await?;
        Ok(())
    }

    /// First write of a new task: record, retention entry, command registry.
    async fn write_task_record(
        &self,
        conn: &mut MultiplexedConnection,
        task: &Task,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let json = serde_json::to_string(task)?;
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        pipe.hset(keyspace::tasks_hash(), &task.id, json).ignore();
        pipe.zadd(keyspace::retention_zset(), &task.id, self.retention_cutoff(now))
            .ignore();
        pipe.sadd(keyspace::commands_set(), &task.command).ignore();
        let _: () = pipe.query_async(conn).await?;
        Ok(())
    }

    /// Place a task: delayed zset for a future visibility, otherwise the
    /// pending tier for its priority. Returns the queue's total pending
    /// depth after an immediate placement.
    async fn place(
        &self,
        conn: &mut MultiplexedConnection,
        task: &Task,
        visible_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<u64>> {
        if let Some(at) = visible_at.filter(|at| *at > now) {
            let key = keyspace::delayed_zset(&task.command, &task.tenant_id);
            let _: i64 = conn.zadd(key, &task.id, at.timestamp()).await?;
            return Ok(None);
        }

        let tier_key = keyspace::pending_list(&task.command, &task.tenant_id, task.priority);
        let tier_len: i64 = conn.lpush(tier_key, &task.id).await?;

        let mut pipe = ::redis::pipe();
        for priority in 0..=MAX_PRIORITY {
            if priority != task.priority {
                pipe.llen(keyspace::pending_list(&task.command, &task.tenant_id, priority));
            }
        }
        let other_tiers: Vec<i64> = pipe.query_async(conn).await?;
        let depth = tier_len as u64 + other_tiers.iter().map(|l| *l as u64).sum::<u64>();
        Ok(Some(depth))
    }

    /// Resolve an idempotency key to its existing task, dropping stale
    /// mappings whose task record is already gone.
    async fn lookup_idempotent(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
    ) -> CoreResult<Option<Task>> {
        let mapping_key = keyspace::idempotency(key);
        let existing_id: Option<String> = conn.get(&mapping_key).await?;
        let Some(existing_id) = existing_id else {
            return Ok(None);
        };
        match self.load_task(conn, &existing_id).await? {
            Some(task) => Ok(Some(task)),
            None => {
                // The mapped task was cleaned up; the mapping is dead weight.
                let _: i64 = conn.del(&mapping_key).await?;
                Ok(None)
            }
        }
    }

    /// Sample the in-progress set and nack every member whose lease has
    /// lapsed. Bounded: `inspect_limit` samples, one TTL probe each.
    async fn repair_expired(
        &self,
        conn: &mut MultiplexedConnection,
        command: &str,
        tenant_id: &str,
        req: &ClaimRequest,
    ) -> CoreResult<()> {
        let inprog_key = keyspace::in_progress_set(command, tenant_id);
        let sample: Vec<String> = conn
            .srandmember_multiple(&inprog_key, req.inspect_limit)
            .await?;
        if sample.is_empty() {
            return Ok(());
        }

        let mut pipe = ::redis::pipe();
        for id in &sample {
            pipe.ttl(keyspace::lease(id));
        }
        let ttls: Vec<i64> = pipe.query_async(conn).await?;

        for (id, ttl) in sample.iter().zip(ttls) {
            if ttl > 0 {
                continue;
            }
            match self
                .nack(id, "", 0, req.max_attempts_default, REASON_LEASE_EXPIRED)
                .await
            {
                Ok(outcome) if outcome.to_dlq => {
                    self.metrics.inc_leases_expired();
                    warn!(task_id = %id, command, "lease expired with attempts exhausted — dead-lettered");
                }
                Ok(_) => {
                    self.metrics.inc_leases_expired();
                    info!(task_id = %id, command, "lease expired — requeued");
                }
                Err(CoreError::NotFound(_)) => {
                    // Record gone but the set still references it.
                    self.ghost_filter.insert(id);
                    let _: i64 = conn.srem(&inprog_key, id).await?;
                }
                Err(CoreError::NotInProgress { .. }) => {
                    // Another claimer repaired it between sample and nack.
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for RedisRepository {
    async fn enqueue(&self, new: NewTask) -> CoreResult<EnqueueOutcome> {
        if new.command.trim().is_empty() {
            return Err(CoreError::validation("command must not be blank"));
        }
        let mut conn = self.store.conn();
        let now = Utc::now();
        let visible_at = new.visible_at;
        let idempotency_key = new.idempotency_key.clone().filter(|k| !k.is_empty());

        if let Some(key) = idempotency_key {
            // Definitely-fresh keys skip the store lookup entirely.
            if self.idempo_filter.maybe_contains(&key) {
                if let Some(existing) = self.lookup_idempotent(&mut conn, &key).await? {
                    debug!(task_id = %existing.id, "idempotency key resolved to existing task");
                    return Ok(EnqueueOutcome {
                        task: existing,
                        created: false,
                        pending_depth: None,
                    });
                }
            }

            let task = new.into_task(now);
            self.write_task_record(&mut conn, &task, now).await?;

            let won: Option<String> = ::redis::cmd("SET")
                .arg(keyspace::idempotency(&key))
                .arg(&task.id)
                .arg("NX")
                .arg("EX")
                .arg(self.retention_seconds)
                .query_async(&mut conn)
                .await?;

            if won.is_none() {
                // Lost the race: unwind our record, hand back the winner's.
                let mut pipe = ::redis::pipe();
                pipe.atomic();
                pipe.hdel(keyspace::tasks_hash(), &task.id).ignore();
                pipe.zrem(keyspace::retention_zset(), &task.id).ignore();
                let _: () = pipe.query_async(&mut conn).await?;

                return match self.lookup_idempotent(&mut conn, &key).await? {
                    Some(winner) => Ok(EnqueueOutcome {
                        task: winner,
                        created: false,
                        pending_depth: None,
                    }),
                    None => Err(CoreError::Storage(
                        "idempotency mapping vanished during enqueue race".into(),
                    )),
                };
            }

            self.idempo_filter.insert(&key);
            let pending_depth = self.place(&mut conn, &task, visible_at, now).await?;
            return Ok(EnqueueOutcome {
                task,
                created: true,
                pending_depth,
            });
        }

        let task = new.into_task(now);
        self.write_task_record(&mut conn, &task, now).await?;
        let pending_depth = self.place(&mut conn, &task, visible_at, now).await?;
        Ok(EnqueueOutcome {
            task,
            created: true,
            pending_depth,
        })
    }

    async fn get_task(&self, task_id: &str) -> CoreResult<Task> {
        let mut conn = self.store.conn();
        self.load_task(&mut conn, task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(task_id.to_string()))
    }

    async fn claim(&self, req: &ClaimRequest) -> CoreResult<Option<Task>> {
        let mut conn = self.store.conn();

        for command in &req.commands {
            self.move_due_delayed(command, &req.tenant_id, req.inspect_limit)
                .await?;
            if !req.tenant_id.is_empty() {
                // Legacy single-tenant zset — older producers still park
                // delayed work there.
                self.move_due_delayed(command, "", req.inspect_limit).await?;
            }
            self.repair_expired(&mut conn, command, &req.tenant_id, req)
                .await?;
        }

        for command in &req.commands {
            let inprog_key = keyspace::in_progress_set(command, &req.tenant_id);
            for priority in (0..=MAX_PRIORITY).rev() {
                let pending_key = keyspace::pending_list(command, &req.tenant_id, priority);

                // Retry budget per tier: ghost hits consume it.
                for _ in 0..req.inspect_limit.max(1) {
                    let id: Option<String> = scripts::CLAIM_MOVE
                        .key(&pending_key)
                        .key(&inprog_key)
                        .arg(req.inspect_limit.max(1))
                        .invoke_async(&mut conn)
                        .await?;
                    let Some(id) = id else {
                        break; // tier exhausted
                    };

                    if self.ghost_filter.maybe_contains(&id) {
                        // Administratively deleted — clear the stale reference
                        // without touching the hash.
                        let _: i64 = conn.srem(&inprog_key, &id).await?;
                        continue;
                    }

                    let Some(mut task) = self.load_task(&mut conn, &id).await? else {
                        self.ghost_filter.insert(&id);
                        let _: i64 = conn.srem(&inprog_key, &id).await?;
                        continue;
                    };

                    let now = Utc::now();
                    let lease_key = keyspace::lease(&id);
                    let lease: Result<(), ::redis::RedisError> = conn
                        .set_ex(&lease_key, &req.worker_id, req.lease_seconds)
                        .await;
                    if let Err(e) = lease {
                        // Unwind to the tail the id was popped from.
                        let _: Result<i64, _> = conn.rpush(&pending_key, &id).await;
                        let _: Result<i64, _> = conn.srem(&inprog_key, &id).await;
                        return Err(e.into());
                    }

                    task.status = TaskStatus::InProgress;
                    task.worker_id = Some(req.worker_id.clone());
                    task.lease_until = Some(now + Duration::seconds(req.lease_seconds as i64));
                    task.attempts += 1;
                    task.updated_at = now;
                    self.save_task(&mut conn, &task, now).await?;

                    debug!(
                        task_id = %task.id,
                        command,
                        worker = %req.worker_id,
                        attempts = task.attempts,
                        "task claimed"
                    );
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
        let mut conn = self.store.conn();
        let mut task = self
            .load_task(&mut conn, task_id)
            .await?
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

        let now = Utc::now();
        let _: () = conn
            .set_ex(keyspace::lease(task_id), worker_id, extend_seconds)
            .await?;
        task.lease_until = Some(now + Duration::seconds(extend_seconds as i64));
        task.updated_at = now;
        self.save_task(&mut conn, &task, now).await?;
        Ok(task)
    }

    async fn abandon(&self, task_id: &str, worker_id: &str) -> CoreResult<()> {
        let mut conn = self.store.conn();
        let mut task = self
            .load_task(&mut conn, task_id)
            .await?
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

        let now = Utc::now();
        task.status = TaskStatus::Pending;
        task.clear_lease();
        task.updated_at = now;
        let json = serde_json::to_string(&task)?;

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        pipe.srem(keyspace::in_progress_set(&task.command, &task.tenant_id), task_id)
            .ignore();
        pipe.del(keyspace::lease(task_id)).ignore();
        pipe.lpush(
            keyspace::pending_list(&task.command, &task.tenant_id, task.priority),
            task_id,
        )
        .ignore();
        pipe.hset(keyspace::tasks_hash(), task_id, json).ignore();
        pipe.zadd(keyspace::retention_zset(), task_id, self.retention_cutoff(now))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        info!(task_id = %task_id, worker = %worker_id, "task abandoned — requeued");
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
        let mut conn = self.store.conn();
        let mut task = self
            .load_task(&mut conn, task_id)
            .await?
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

        let now = Utc::now();
        let effective_max = if task.max_attempts > 0 {
            task.max_attempts
        } else {
            max_attempts_default
        };
        let inprog_key = keyspace::in_progress_set(&task.command, &task.tenant_id);

        if task.attempts >= effective_max {
            task.status = TaskStatus::Failed;
            task.error = Some(if reason.is_empty() {
                REASON_MAX_ATTEMPTS.to_string()
            } else {
                reason.to_string()
            });
            task.clear_lease();
            task.updated_at = now;
            let json = serde_json::to_string(&task)?;

            let mut pipe = ::redis::pipe();
            pipe.atomic();
            pipe.srem(&inprog_key, task_id).ignore();
            pipe.del(keyspace::lease(task_id)).ignore();
            pipe.sadd(keyspace::dlq_set(&task.command, &task.tenant_id), task_id)
                .ignore();
            pipe.hset(keyspace::tasks_hash(), task_id, json).ignore();
            pipe.zadd(keyspace::retention_zset(), task_id, self.retention_cutoff(now))
                .ignore();
            let _: () = pipe.query_async(&mut conn).await?;

            self.metrics.inc_tasks_failed();
            let elapsed = (now - task.created_at).num_milliseconds();
            self.metrics
                .processing_latency
                .observe((elapsed.max(0) as f64) / 1000.0);
            warn!(
                task_id = %task_id,
                attempts = task.attempts,
                max_attempts = effective_max,
                reason,
                "attempts exhausted — dead-lettered"
            );
            return Ok(NackOutcome {
                delay_seconds: 0,
                to_dlq: true,
            });
        }

        task.status = TaskStatus::Pending;
        task.clear_lease();
        task.updated_at = now;
        let json = serde_json::to_string(&task)?;

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        pipe.srem(&inprog_key, task_id).ignore();
        pipe.del(keyspace::lease(task_id)).ignore();
        if delay_seconds == 0 {
            // A delayed entry scored `now` is due immediately — skip the
            // zset round-trip and make it claimable by the next sweep.
            pipe.lpush(
                keyspace::pending_list(&task.command, &task.tenant_id, task.priority),
                task_id,
            )
            .ignore();
        } else {
            pipe.zadd(
                keyspace::delayed_zset(&task.command, &task.tenant_id),
                task_id,
                now.timestamp() + delay_seconds as i64,
            )
            .ignore();
        }
        pipe.hset(keyspace::tasks_hash(), task_id, json).ignore();
        pipe.zadd(keyspace::retention_zset(), task_id, self.retention_cutoff(now))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(task_id = %task_id, delay_seconds, reason, "task nacked");
        Ok(NackOutcome {
            delay_seconds,
            to_dlq: false,
        })
    }

    async fn submit_result(
        &self,
        task_id: &str,
        submission: ResultSubmission,
    ) -> CoreResult<(Task, TaskResult)> {
        let mut conn = self.store.conn();
        let mut task = self
            .load_task(&mut conn, task_id)
            .await?
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

        let now = Utc::now();
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

        let task_json = serde_json::to_string(&task)?;
        let result_json = serde_json::to_string(&result)?;

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        pipe.hset(keyspace::results_hash(), task_id, result_json)
            .ignore();
        pipe.srem(keyspace::in_progress_set(&task.command, &task.tenant_id), task_id)
            .ignore();
        pipe.del(keyspace::lease(task_id)).ignore();
        pipe.hset(keyspace::tasks_hash(), task_id, task_json).ignore();
        pipe.zadd(keyspace::retention_zset(), task_id, self.retention_cutoff(now))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        info!(
            task_id = %task_id,
            status = task.status.as_str(),
            "result recorded"
        );
        Ok((task, result))
    }

    async fn get_result(&self, task_id: &str) -> CoreResult<Option<TaskResult>> {
        let mut conn = self.store.conn();
        let raw: Option<String> = conn.hget(keyspace::results_hash(), task_id).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn move_due_delayed(
        &self,
        command: &str,
        tenant_id: &str,
        limit: usize,
    ) -> CoreResult<u64> {
        let mut conn = self.store.conn();
        let delayed_key = keyspace::delayed_zset(command, tenant_id);
        let now = Utc::now();

        let due: Vec<String> = conn
            .zrangebyscore_limit(&delayed_key, "-inf", now.timestamp(), 0, limit as isize)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut moved = 0u64;
        for id in due {
            let Some(mut task) = self.load_task(&mut conn, &id).await? else {
                // Record gone — drop the orphaned entry.
                let _: i64 = conn.zrem(&delayed_key, &id).await?;
                continue;
            };

            // The pending tier comes from the task's own tenant, so entries
            // in the legacy zset still land in the right queue.
            let pending_key =
                keyspace::pending_list(&task.command, &task.tenant_id, task.priority);
            let promoted: i64 = scripts::PROMOTE_DELAYED
                .key(&delayed_key)
                .key(&pending_key)
                .arg(&id)
                .invoke_async(&mut conn)
                .await?;
            if promoted != 1 {
                continue; // another claimer won the promotion
            }

            if task.status != TaskStatus::Pending || task.worker_id.is_some() {
                task.status = TaskStatus::Pending;
                task.clear_lease();
                task.updated_at = now;
                self.save_task(&mut conn, &task, now).await?;
            }
            moved += 1;
        }
        if moved > 0 {
            debug!(command, tenant = tenant_id, moved, "promoted due delayed tasks");
        }
        Ok(moved)
    }

    async fn cleanup_expired(&self, limit: usize, before: DateTime<Utc>) -> CoreResult<u64> {
        let mut conn = self.store.conn();
        let expired: Vec<String> = conn
            .zrangebyscore_limit(
                keyspace::retention_zset(),
                "-inf",
                before.timestamp(),
                0,
                limit as isize,
            )
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0u64;
        for id in &expired {
            match self.load_task(&mut conn, id).await? {
                Some(task) => {
                    let mut pipe = ::redis::pipe();
                    pipe.atomic();
                    pipe.hdel(keyspace::tasks_hash(), id).ignore();
                    pipe.hdel(keyspace::results_hash(), id).ignore();
                    pipe.zrem(keyspace::retention_zset(), id).ignore();
                    pipe.del(keyspace::lease(id)).ignore();
                    for priority in 0..=MAX_PRIORITY {
                        pipe.lrem(
                            keyspace::pending_list(&task.command, &task.tenant_id, priority),
                            0,
                            id,
                        )
                        .ignore();
                    }
                    pipe.srem(keyspace::in_progress_set(&task.command, &task.tenant_id), id)
                        .ignore();
                    pipe.zrem(keyspace::delayed_zset(&task.command, &task.tenant_id), id)
                        .ignore();
                    pipe.srem(keyspace::dlq_set(&task.command, &task.tenant_id), id)
                        .ignore();
                    if !task.tenant_id.is_empty() {
                        // The legacy zset may still reference the id.
                        pipe.zrem(keyspace::delayed_zset(&task.command, ""), id).ignore();
                    }
                    let _: () = pipe.query_async(&mut conn).await?;
                    deleted += 1;
                }
                None => {
                    // Tenant unrecoverable — best-effort sweep across known
                    // commands at the empty tenant. Tenant-scoped orphans are
                    // left to a future sweep.
                    let commands: Vec<String> = conn.smembers(keyspace::commands_set()).await?;
                    let mut pipe = ::redis::pipe();
                    pipe.zrem(keyspace::retention_zset(), id).ignore();
                    pipe.hdel(keyspace::results_hash(), id).ignore();
                    pipe.del(keyspace::lease(id)).ignore();
                    for command in &commands {
                        for priority in 0..=MAX_PRIORITY {
                            pipe.lrem(keyspace::pending_list(command, "", priority), 0, id)
                                .ignore();
                        }
                        pipe.srem(keyspace::in_progress_set(command, ""), id).ignore();
                        pipe.zrem(keyspace::delayed_zset(command, ""), id).ignore();
                        pipe.srem(keyspace::dlq_set(command, ""), id).ignore();
                    }
                    let _: () = pipe.query_async(&mut conn).await?;
                    deleted += 1;
                }
            }
        }

        info!(deleted, "retention cleanup pass complete");
        Ok(deleted)
    }

    async fn queue_stats(&self, command: &str, tenant_id: &str) -> CoreResult<QueueStats> {
        let mut conn = self.store.conn();
        let mut pipe = ::redis::pipe();
        for priority in 0..=MAX_PRIORITY {
            pipe.llen(keyspace::pending_list(command, tenant_id, priority));
        }
        pipe.zcard(keyspace::delayed_zset(command, tenant_id));
        pipe.scard(keyspace::in_progress_set(command, tenant_id));
        pipe.scard(keyspace::dlq_set(command, tenant_id));
        let counts: Vec<i64> = pipe.query_async(&mut conn).await?;

        let tiers = MAX_PRIORITY as usize + 1;
        let ready = counts[..tiers].iter().map(|c| *c as u64).sum();
        Ok(QueueStats {
            ready,
            delayed: counts[tiers] as u64,
            in_progress: counts[tiers + 1] as u64,
            dlq: counts[tiers + 2] as u64,
        })
    }

    async fn known_commands(&self) -> CoreResult<Vec<String>> {
        let mut conn = self.store.conn();
        let mut commands: Vec<String> = conn.smembers(keyspace::commands_set()).await?;
        commands.sort();
        Ok(commands)
    }
}
