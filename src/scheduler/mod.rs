// SPDX-License-Identifier: MIT
//! Scheduler service — validation and higher-level protocols over the task
//! repository.
//!
//! The service owns what the repository does not: request validation,
//! delayed-vs-immediate placement, the cooperative long-poll claim loop,
//! policy-computed nack delays, cleanup defaults, and the "queue became
//! non-empty" hint handed to the notifier. All cross-handler coordination
//! stays in the storage backend; this struct carries only configuration,
//! counters, and an injected RNG.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::debug;

use crate::backoff::{self, BackoffPolicy};
use crate::callbacks::CallbackDispatcher;
use crate::error::{CoreError, CoreResult};
use crate::metrics::SharedMetrics;
use crate::model::{NackOutcome, NewTask, QueueStats, Task, TaskResult, TaskStatus};
use crate::notify::Notifier;
use crate::repo::{ClaimRequest, ResultSubmission, TaskRepository};

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Attempt budget applied when the producer supplies none.
    pub default_max_attempts: u32,
    /// Lease granted when a claim supplies no lease seconds.
    pub default_lease_seconds: u64,
    /// Hard cap on claim long-poll waits.
    pub max_wait_seconds: u64,
    /// Sleep between claim polls while long-polling.
    pub poll_interval: Duration,
    /// Budget for claim-move retries and the expired-lease repair sample.
    pub inspect_limit: usize,
    pub backoff_policy: BackoffPolicy,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    /// Default batch size for one retention cleanup pass.
    pub cleanup_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_lease_seconds: 60,
            max_wait_seconds: 30,
            poll_interval: Duration::from_millis(250),
            inspect_limit: 16,
            backoff_policy: BackoffPolicy::Exponential,
            backoff_base_seconds: 5,
            backoff_max_seconds: 900,
            cleanup_limit: 1000,
        }
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub command: String,
    pub payload: serde_json::Value,
    pub priority: Option<i64>,
    pub max_attempts: Option<u32>,
    pub webhook: Option<String>,
    pub idempotency_key: Option<String>,
    /// Absolute visibility time; wins over `delay_seconds`.
    pub run_at: Option<DateTime<Utc>>,
    pub delay_seconds: Option<u64>,
    pub tenant_id: String,
    pub trace_parent: Option<String>,
    pub trace_state: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimTaskRequest {
    pub worker_id: String,
    /// Empty means "every known command".
    pub commands: Vec<String>,
    pub lease_seconds: Option<u64>,
    pub wait_seconds: Option<u64>,
    pub tenant_id: String,
}

#[derive(Debug, Clone)]
pub struct SubmitResultRequest {
    pub worker_id: String,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub artifacts: Vec<crate::model::Artifact>,
}

/// Outcome of one cleanup pass, echoed back to the operator.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub deleted: u64,
    pub before: DateTime<Utc>,
    pub limit: usize,
}

// ─── Service ──────────────────────────────────────────────────────────────────

pub struct SchedulerService {
    repo: Arc<dyn TaskRepository>,
    config: SchedulerConfig,
    metrics: SharedMetrics,
    notifier: Option<Arc<Notifier>>,
    callbacks: Option<Arc<CallbackDispatcher>>,
    /// Non-global randomness for jittered nack delays.
    rng: Mutex<SmallRng>,
}

impl SchedulerService {
    pub fn new(repo: Arc<dyn TaskRepository>, config: SchedulerConfig, metrics: SharedMetrics) -> Self {
        Self {
            repo,
            config,
            metrics,
            notifier: None,
            callbacks: None,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<CallbackDispatcher>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validate, place, and — when an empty queue just became non-empty —
    /// hint the notifier. Returns the task and whether it was newly created.
    pub async fn create_task(&self, req: CreateTaskRequest) -> CoreResult<(Task, bool)> {
        if req.command.trim().is_empty() {
            return Err(CoreError::validation("command must not be blank"));
        }
        if let Some(webhook) = req.webhook.as_deref() {
            validate_webhook_url(webhook)?;
        }

        let now = Utc::now();
        let visible_at = match (req.run_at, req.delay_seconds) {
            (Some(at), _) => Some(at),
            (None, Some(delay)) if delay > 0 => {
                Some(now + chrono::Duration::seconds(delay as i64))
            }
            _ => None,
        };

        let new = NewTask {
            command: req.command,
            payload: req.payload.to_string(),
            priority: req.priority.unwrap_or(0).clamp(0, 9) as u8,
            max_attempts: req
                .max_attempts
                .filter(|m| *m > 0)
                .unwrap_or(self.config.default_max_attempts),
            webhook: req.webhook,
            idempotency_key: req.idempotency_key,
            visible_at,
            tenant_id: req.tenant_id,
            trace_parent: req.trace_parent,
            trace_state: req.trace_state,
        };

        let outcome = self.repo.enqueue(new).await?;
        if outcome.created {
            self.metrics.inc_tasks_created();
        }

        if outcome.became_non_empty() {
            if let Some(notifier) = &self.notifier {
                let notifier = Arc::clone(notifier);
                let command = outcome.task.command.clone();
                let depth = outcome.pending_depth.unwrap_or(1);
                // Advisory and out-of-band — never blocks or fails the enqueue.
                tokio::spawn(async move {
                    notifier.queue_non_empty(&command, depth).await;
                });
            }
        }

        Ok((outcome.task, outcome.created))
    }

    /// Cooperative long-poll claim. `wait_seconds = 0` is a single attempt;
    /// anything longer polls every `poll_interval` until the deadline, and
    /// never blocks past `max_wait_seconds`.
    pub async fn claim_task(&self, req: ClaimTaskRequest) -> CoreResult<Option<Task>> {
        if req.worker_id.trim().is_empty() {
            return Err(CoreError::validation("workerId must not be blank"));
        }

        let commands = if req.commands.is_empty() {
            self.repo.known_commands().await?
        } else {
            req.commands
        };
        if commands.is_empty() {
            return Ok(None);
        }

        let claim_req = ClaimRequest {
            worker_id: req.worker_id,
            commands,
            tenant_id: req.tenant_id,
            lease_seconds: req
                .lease_seconds
                .filter(|s| *s > 0)
                .unwrap_or(self.config.default_lease_seconds),
            inspect_limit: self.config.inspect_limit,
            max_attempts_default: self.config.default_max_attempts,
        };

        let wait = Duration::from_secs(
            req.wait_seconds
                .unwrap_or(0)
                .min(self.config.max_wait_seconds),
        );
        let deadline = Instant::now() + wait;

        loop {
            if let Some(task) = self.repo.claim(&claim_req).await? {
                self.metrics.inc_tasks_claimed();
                return Ok(Some(task));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(self.config.poll_interval)).await;
        }
    }

    /// Extend the caller's lease; a zero/absent extension means the default.
    pub async fn heartbeat(
        &self,
        task_id: &str,
        worker_id: &str,
        extend_seconds: Option<u64>,
    ) -> CoreResult<Task> {
        let extend = extend_seconds
            .filter(|s| *s > 0)
            .unwrap_or(self.config.default_lease_seconds);
        self.repo.heartbeat(task_id, worker_id, extend).await
    }

    pub async fn abandon(&self, task_id: &str, worker_id: &str) -> CoreResult<()> {
        self.repo.abandon(task_id, worker_id).await
    }

    /// Negative-acknowledge. A missing or zero client delay is computed from
    /// the backoff policy on the task's attempt count; an explicit delay is
    /// capped at the policy maximum.
    pub async fn nack_task(
        &self,
        task_id: &str,
        worker_id: &str,
        delay_seconds: Option<u64>,
    ) -> CoreResult<NackOutcome> {
        let task = self.repo.get_task(task_id).await?;

        let delay = match delay_seconds {
            Some(d) if d > 0 => d.min(self.config.backoff_max_seconds),
            _ => {
                let mut rng = self.rng.lock().expect("rng mutex poisoned");
                backoff::delay_seconds(
                    self.config.backoff_policy,
                    self.config.backoff_base_seconds,
                    self.config.backoff_max_seconds,
                    task.attempts,
                    &mut *rng,
                )
            }
        };

        self.repo
            .nack(
                task_id,
                worker_id,
                delay,
                self.config.default_max_attempts,
                "",
            )
            .await
    }

    /// Record a worker's result, finish the task, and kick off the result
    /// callback when the task carries a webhook.
    pub async fn submit_result(
        &self,
        task_id: &str,
        req: SubmitResultRequest,
    ) -> CoreResult<TaskResult> {
        match req.status {
            TaskStatus::Completed => {
                if req.result.is_none() {
                    return Err(CoreError::validation(
                        "a COMPLETED submission requires a result object",
                    ));
                }
            }
            TaskStatus::Failed => {
                if req.error.as_deref().unwrap_or("").is_empty() {
                    return Err(CoreError::validation(
                        "a FAILED submission requires a non-empty error",
                    ));
                }
            }
            _ => {
                return Err(CoreError::validation(
                    "result status must be COMPLETED or FAILED",
                ))
            }
        }

        let submission = ResultSubmission {
            worker_id: req.worker_id,
            status: req.status,
            result: req.result,
            error: req.error,
            artifacts: req.artifacts,
        };
        let (task, result) = self.repo.submit_result(task_id, submission).await?;

        match result.status {
            TaskStatus::Completed => self.metrics.inc_tasks_completed(),
            _ => self.metrics.inc_tasks_failed(),
        }
        let elapsed = (result.completed_at - task.created_at).num_milliseconds();
        self.metrics
            .processing_latency
            .observe((elapsed.max(0) as f64) / 1000.0);

        if let (Some(callbacks), Some(_)) = (&self.callbacks, task.webhook.as_ref()) {
            callbacks.dispatch(&task, &result);
        }

        debug!(task_id = %task_id, status = result.status.as_str(), "result submitted");
        Ok(result)
    }

    pub async fn get_task(&self, task_id: &str) -> CoreResult<Task> {
        self.repo.get_task(task_id).await
    }

    pub async fn task_with_result(
        &self,
        task_id: &str,
    ) -> CoreResult<(Task, Option<TaskResult>)> {
        let task = self.repo.get_task(task_id).await?;
        let result = self.repo.get_result(task_id).await?;
        Ok((task, result))
    }

    /// Retention sweep with operator-friendly defaults: `before = now`,
    /// `limit = cleanup_limit`.
    pub async fn cleanup_expired(
        &self,
        limit: Option<usize>,
        before: Option<DateTime<Utc>>,
    ) -> CoreResult<CleanupOutcome> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(self.config.cleanup_limit);
        let before = before.unwrap_or_else(Utc::now);
        let deleted = self.repo.cleanup_expired(limit, before).await?;
        Ok(CleanupOutcome {
            deleted,
            before,
            limit,
        })
    }

    pub async fn queue_stats(&self, command: &str, tenant_id: &str) -> CoreResult<QueueStats> {
        self.repo.queue_stats(command, tenant_id).await
    }

    /// Aggregate depths per known command. Best-effort — not transactionally
    /// consistent with concurrent mutations.
    pub async fn admin_queues(&self, tenant_id: &str) -> CoreResult<Vec<(String, QueueStats)>> {
        let commands = self.repo.known_commands().await?;
        let mut out = Vec::with_capacity(commands.len());
        for command in commands {
            let stats = self.repo.queue_stats(&command, tenant_id).await?;
            out.push((command, stats));
        }
        Ok(out)
    }
}

fn validate_webhook_url(url: &str) -> CoreResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| CoreError::validation(format!("invalid webhook url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(CoreError::validation(format!(
            "webhook url scheme must be http or https, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CoreMetrics;
    use crate::repo::memory::MemoryRepository;

    fn service() -> SchedulerService {
        SchedulerService::new(
            Arc::new(MemoryRepository::default()),
            SchedulerConfig::default(),
            Arc::new(CoreMetrics::new()),
        )
    }

    fn create_req(command: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            command: command.into(),
            payload: serde_json::json!({}),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_rejects_blank_command_and_bad_webhook() {
        let svc = service();
        let err = svc.create_task(create_req("  ")).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let err = svc
            .create_task(CreateTaskRequest {
                webhook: Some("ftp://example.com/hook".into()),
                ..create_req("build")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn claim_rejects_blank_worker() {
        let svc = service();
        let err = svc
            .claim_task(ClaimTaskRequest {
                worker_id: " ".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_commands_default_to_known_commands() {
        let svc = service();
        svc.create_task(create_req("build")).await.unwrap();
        let task = svc
            .claim_task(ClaimTaskRequest {
                worker_id: "w-1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(task.unwrap().command, "build");
    }

    #[tokio::test]
    async fn run_at_wins_over_delay_seconds() {
        let svc = service();
        let (task, _) = svc
            .create_task(CreateTaskRequest {
                run_at: Some(Utc::now() + chrono::Duration::seconds(3600)),
                delay_seconds: Some(0),
                ..create_req("build")
            })
            .await
            .unwrap();

        // Parked in delayed — not claimable yet.
        let claimed = svc
            .claim_task(ClaimTaskRequest {
                worker_id: "w-1".into(),
                commands: vec!["build".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(claimed.is_none(), "task {} should be delayed", task.id);
    }

    #[tokio::test]
    async fn nack_without_delay_uses_the_backoff_policy() {
        let svc = service();
        svc.create_task(create_req("build")).await.unwrap();
        let task = svc
            .claim_task(ClaimTaskRequest {
                worker_id: "w-1".into(),
                commands: vec!["build".into()],
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();

        // Default policy: exponential, base 5, max 900; attempts = 1 → 10s.
        let outcome = svc.nack_task(&task.id, "w-1", Some(0)).await.unwrap();
        assert_eq!(outcome.delay_seconds, 10);
        assert!(!outcome.to_dlq);
    }

    #[tokio::test]
    async fn explicit_nack_delay_is_capped() {
        let svc = service();
        svc.create_task(create_req("build")).await.unwrap();
        let task = svc
            .claim_task(ClaimTaskRequest {
                worker_id: "w-1".into(),
                commands: vec!["build".into()],
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();

        let outcome = svc.nack_task(&task.id, "w-1", Some(10_000)).await.unwrap();
        assert_eq!(outcome.delay_seconds, 900);
    }

    #[tokio::test]
    async fn submission_validation_per_status() {
        let svc = service();
        svc.create_task(create_req("build")).await.unwrap();
        let task = svc
            .claim_task(ClaimTaskRequest {
                worker_id: "w-1".into(),
                commands: vec!["build".into()],
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();

        let err = svc
            .submit_result(
                &task.id,
                SubmitResultRequest {
                    worker_id: "w-1".into(),
                    status: TaskStatus::Completed,
                    result: None,
                    error: None,
                    artifacts: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let err = svc
            .submit_result(
                &task.id,
                SubmitResultRequest {
                    worker_id: "w-1".into(),
                    status: TaskStatus::Pending,
                    result: None,
                    error: None,
                    artifacts: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn long_poll_returns_promptly_after_late_enqueue() {
        let svc = Arc::new(service());
        let claimer = Arc::clone(&svc);
        let handle = tokio::spawn(async move {
            claimer
                .claim_task(ClaimTaskRequest {
                    worker_id: "w-1".into(),
                    commands: vec!["build".into()],
                    wait_seconds: Some(5),
                    ..Default::default()
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        svc.create_task(create_req("build")).await.unwrap();

        let task = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("long-poll did not finish")
            .unwrap()
            .unwrap();
        assert!(task.is_some());
    }
}
