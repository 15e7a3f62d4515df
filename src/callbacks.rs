// SPDX-License-Identifier: MIT
//! Result-callback dispatcher.
//!
//! When a result is submitted for a task that carries a `webhook`, a
//! fire-and-forget background task posts the result payload and retries on
//! non-2xx / transport errors with exponential backoff. A global rate gate
//! may delay an attempt; waiting out the gate consumes wall time, never an
//! attempt. Only the W3C `traceparent` / `tracestate` headers are propagated
//! to the third-party endpoint — baggage is deliberately suppressed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics::SharedMetrics;
use crate::model::{Artifact, Task, TaskResult, TaskStatus};
use crate::notify::signing;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Attempt budget, including the first try.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per retry.
    pub base_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Global outbound budget; 0 disables the gate.
    pub max_sends_per_second: u32,
    /// Shared secret; when set, payloads carry timestamp + signature headers.
    pub secret: Option<String>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_sends_per_second: 0,
            secret: None,
        }
    }
}

// ─── Rate gate ────────────────────────────────────────────────────────────────

/// Fixed-window outbound budget shared by every in-flight callback.
struct RateGate {
    max_per_second: u32,
    window: Mutex<(i64, u32)>,
}

impl RateGate {
    fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            window: Mutex::new((0, 0)),
        }
    }

    /// `None` when a slot was taken, otherwise how long to sleep before
    /// asking again.
    fn acquire(&self) -> Option<Duration> {
        let now = Utc::now();
        let second = now.timestamp();
        let mut window = self.window.lock().expect("rate gate mutex poisoned");
        if window.0 != second {
            *window = (second, 0);
        }
        if window.1 < self.max_per_second {
            window.1 += 1;
            return None;
        }
        let to_next_second = 1000 - (now.timestamp_subsec_millis() as u64).min(999);
        Some(Duration::from_millis(to_next_second))
    }
}

// ─── Payload ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallbackPayload {
    task_id: String,
    event_type: String,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    artifacts: Vec<Artifact>,
    completed_at: chrono::DateTime<Utc>,
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

pub struct CallbackDispatcher {
    config: CallbackConfig,
    http: reqwest::Client,
    gate: Option<Arc<RateGate>>,
    metrics: SharedMetrics,
}

impl CallbackDispatcher {
    pub fn new(config: CallbackConfig, metrics: SharedMetrics) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("reqwest client");
        let gate = (config.max_sends_per_second > 0)
            .then(|| Arc::new(RateGate::new(config.max_sends_per_second)));
        Arc::new(Self {
            config,
            http,
            gate,
            metrics,
        })
    }

    /// Spawn a background delivery for this task's result. Retry state lives
    /// on the spawned task's stack; nothing is persisted.
    pub fn dispatch(self: &Arc<Self>, task: &Task, result: &TaskResult) {
        let Some(webhook) = task.webhook.clone() else {
            return;
        };
        let payload = CallbackPayload {
            task_id: task.id.clone(),
            event_type: task.command.clone(),
            status: result.status,
            result: result.result.clone(),
            error: result.error.clone(),
            artifacts: result.artifacts.clone(),
            completed_at: result.completed_at,
        };
        let dispatcher = Arc::clone(self);
        let command = task.command.clone();
        let trace_parent = task.trace_parent.clone();
        let trace_state = task.trace_state.clone();
        tokio::spawn(async move {
            dispatcher
                .deliver(&webhook, &command, payload, trace_parent, trace_state)
                .await;
        });
    }

    async fn deliver(
        &self,
        webhook: &str,
        command: &str,
        payload: CallbackPayload,
        trace_parent: Option<String>,
        trace_state: Option<String>,
    ) {
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(task_id = %payload.task_id, err = %e, "callback payload serialization failed");
                return;
            }
        };

        let mut delay = self.config.base_delay;
        for attempt in 1..=self.config.max_attempts.max(1) {
            // Rate-limit rejections burn wall time, not attempts.
            if let Some(gate) = &self.gate {
                while let Some(wait) = gate.acquire() {
                    tokio::time::sleep(wait).await;
                }
            }

            let mut request = self
                .http
                .post(webhook)
                .header("Content-Type", "application/json")
                .body(body.clone());
            if let Some(parent) = &trace_parent {
                request = request.header("traceparent", parent);
            }
            if let Some(state) = &trace_state {
                request = request.header("tracestate", state);
            }
            if let Some(secret) = &self.config.secret {
                let ts = Utc::now().timestamp();
                request = request
                    .header(signing::TIMESTAMP_HEADER, ts)
                    .header(signing::SIGNATURE_HEADER, signing::sign(secret, ts, &body));
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(task_id = %payload.task_id, attempt, "result callback delivered");
                    self.metrics.record_notification("callback", command, "ok");
                    return;
                }
                Ok(resp) => {
                    warn!(
                        task_id = %payload.task_id,
                        attempt,
                        status = %resp.status(),
                        "result callback rejected"
                    );
                }
                Err(e) => {
                    warn!(task_id = %payload.task_id, attempt, err = %e, "result callback failed");
                }
            }

            if attempt < self.config.max_attempts {
                tokio::time::sleep(delay).await;
                // base * 2^(attempt-1), capped.
                delay = (delay * 2).min(self.config.max_delay);
            }
        }

        warn!(task_id = %payload.task_id, "result callback attempts exhausted");
        self.metrics.record_notification("callback", command, "exhausted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_gate_fills_then_blocks_within_one_second() {
        let gate = RateGate::new(2);
        assert!(gate.acquire().is_none());
        assert!(gate.acquire().is_none());
        let wait = gate.acquire();
        assert!(wait.is_some());
        assert!(wait.unwrap() <= Duration::from_secs(1));
    }

    #[test]
    fn zero_budget_gate_is_never_built() {
        let dispatcher = CallbackDispatcher::new(
            CallbackConfig::default(),
            Arc::new(crate::metrics::CoreMetrics::new()),
        );
        assert!(dispatcher.gate.is_none());
    }
}
