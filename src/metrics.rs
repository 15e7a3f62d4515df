// SPDX-License-Identifier: MIT
//! In-process counters and histograms, exposed as `GET /metrics` in
//! Prometheus text format. No external library — counters are `AtomicU64`
//! incremented inline; the one labeled counter (notification outcomes) is a
//! small mutex-guarded map.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Upper bounds (seconds) of the end-to-end processing latency buckets.
const LATENCY_BUCKETS: [f64; 8] = [0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0, 7200.0];

/// Cumulative histogram of task end-to-end latency (created → terminal).
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 8],
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn observe(&self, seconds: f64) {
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_millis
            .fetch_add((seconds * 1000.0).max(0.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters shared across all request handlers and background tasks.
#[derive(Debug)]
pub struct CoreMetrics {
    /// Tasks accepted by enqueue since process start.
    pub tasks_created: AtomicU64,
    /// Successful claims handed to workers.
    pub tasks_claimed: AtomicU64,
    /// Results recorded with status COMPLETED.
    pub tasks_completed: AtomicU64,
    /// Results recorded with status FAILED plus attempts-exhausted nacks.
    pub tasks_failed: AtomicU64,
    /// Leases found expired by claim-time repair.
    pub leases_expired: AtomicU64,
    /// End-to-end processing latency observed at terminal transitions.
    pub processing_latency: LatencyHistogram,
    /// Notification / callback outcomes keyed by (kind, command, outcome).
    notification_outcomes: Mutex<BTreeMap<(String, String, String), u64>>,
    /// Process start — uptime gauge.
    pub started_at: Instant,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self {
            tasks_created: AtomicU64::new(0),
            tasks_claimed: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            leases_expired: AtomicU64::new(0),
            processing_latency: LatencyHistogram::default(),
            notification_outcomes: Mutex::new(BTreeMap::new()),
            started_at: Instant::now(),
        }
    }

    pub fn inc_tasks_created(&self) {
        self.tasks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_claimed(&self) {
        self.tasks_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_leases_expired(&self) {
        self.leases_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one webhook outcome. `kind` is `fanout`/`group`/`hash` for
    /// availability pushes or `callback` for result callbacks.
    pub fn record_notification(&self, kind: &str, command: &str, outcome: &str) {
        let mut map = self
            .notification_outcomes
            .lock()
            .expect("metrics mutex poisoned");
        *map.entry((kind.to_string(), command.to_string(), outcome.to_string()))
            .or_insert(0) += 1;
    }

    /// Render everything in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let uptime = self.started_at.elapsed().as_secs();
        let created = self.tasks_created.load(Ordering::Relaxed);
        let claimed = self.tasks_claimed.load(Ordering::Relaxed);
        let completed = self.tasks_completed.load(Ordering::Relaxed);
        let failed = self.tasks_failed.load(Ordering::Relaxed);
        let expired = self.leases_expired.load(Ordering::Relaxed);

        let mut out = format!(
            "# HELP codeq_uptime_seconds Process uptime in seconds.\n\
             # TYPE codeq_uptime_seconds gauge\n\
             codeq_uptime_seconds {uptime}\n\
             # HELP codeq_tasks_created_total Tasks accepted by enqueue.\n\
             # TYPE codeq_tasks_created_total counter\n\
             codeq_tasks_created_total {created}\n\
             # HELP codeq_tasks_claimed_total Successful claims handed to workers.\n\
             # TYPE codeq_tasks_claimed_total counter\n\
             codeq_tasks_claimed_total {claimed}\n\
             # HELP codeq_tasks_completed_total Tasks finished with status COMPLETED.\n\
             # TYPE codeq_tasks_completed_total counter\n\
             codeq_tasks_completed_total {completed}\n\
             # HELP codeq_tasks_failed_total Tasks finished with status FAILED.\n\
             # TYPE codeq_tasks_failed_total counter\n\
             codeq_tasks_failed_total {failed}\n\
             # HELP codeq_leases_expired_total Expired leases repaired at claim time.\n\
             # TYPE codeq_leases_expired_total counter\n\
             codeq_leases_expired_total {expired}\n"
        );

        out.push_str(
            "# HELP codeq_processing_seconds End-to-end task latency (created to terminal).\n\
             # TYPE codeq_processing_seconds histogram\n",
        );
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            let count = self.processing_latency.buckets[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "codeq_processing_seconds_bucket{{le=\"{bound}\"}} {count}\n"
            ));
        }
        let count = self.processing_latency.count.load(Ordering::Relaxed);
        let sum = self.processing_latency.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0;
        out.push_str(&format!(
            "codeq_processing_seconds_bucket{{le=\"+Inf\"}} {count}\n\
             codeq_processing_seconds_sum {sum}\n\
             codeq_processing_seconds_count {count}\n"
        ));

        let outcomes = self
            .notification_outcomes
            .lock()
            .expect("metrics mutex poisoned");
        if !outcomes.is_empty() {
            out.push_str(
                "# HELP codeq_notifications_total Webhook deliveries by kind, command, outcome.\n\
                 # TYPE codeq_notifications_total counter\n",
            );
            for ((kind, command, outcome), value) in outcomes.iter() {
                out.push_str(&format!(
                    "codeq_notifications_total{{kind=\"{kind}\",command=\"{command}\",outcome=\"{outcome}\"}} {value}\n"
                ));
            }
        }
        out
    }
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle — cheaply clonable.
pub type SharedMetrics = Arc<CoreMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_rendered_text() {
        let metrics = CoreMetrics::new();
        metrics.inc_tasks_created();
        metrics.inc_tasks_created();
        metrics.inc_tasks_claimed();

        let text = metrics.render_prometheus();
        assert!(text.contains("codeq_tasks_created_total 2"));
        assert!(text.contains("codeq_tasks_claimed_total 1"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = CoreMetrics::new();
        metrics.processing_latency.observe(0.2);
        metrics.processing_latency.observe(10.0);

        let text = metrics.render_prometheus();
        assert!(text.contains("codeq_processing_seconds_bucket{le=\"0.5\"} 1"));
        assert!(text.contains("codeq_processing_seconds_bucket{le=\"15\"} 2"));
        assert!(text.contains("codeq_processing_seconds_count 2"));
    }

    #[test]
    fn notification_outcomes_render_with_labels() {
        let metrics = CoreMetrics::new();
        metrics.record_notification("fanout", "build", "ok");
        metrics.record_notification("fanout", "build", "ok");
        metrics.record_notification("callback", "build", "error");

        let text = metrics.render_prometheus();
        assert!(text
            .contains("codeq_notifications_total{kind=\"fanout\",command=\"build\",outcome=\"ok\"} 2"));
        assert!(text.contains(
            "codeq_notifications_total{kind=\"callback\",command=\"build\",outcome=\"error\"} 1"
        ));
    }
}
