// SPDX-License-Identifier: MIT
//! Worker-availability notifier.
//!
//! Converts "queue became non-empty" hints into at most one webhook delivery
//! per matching subscription, honoring the delivery mode and the
//! per-subscription rate limit. Delivery is advisory: a notified worker must
//! still claim, and notifications are never retried — outcomes only feed the
//! metrics.

pub mod signing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics::SharedMetrics;
use crate::model::{new_id, DeliveryMode, Subscription};
use crate::subscriptions::SubscriptionStore;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Window width for deterministic hash-mode selection.
const HASH_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Claim endpoint advertised to workers in every notification.
    pub claim_url: String,
    /// Shared secret; when set, payloads carry timestamp + signature headers.
    pub secret: Option<String>,
}

/// Availability push payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityEvent<'a> {
    event_type: &'a str,
    available: bool,
    queue_depth: u64,
    claim_url: &'a str,
    sent_at: chrono::DateTime<Utc>,
    notification_id: String,
}

pub struct Notifier {
    subs: Arc<dyn SubscriptionStore>,
    config: NotifierConfig,
    http: reqwest::Client,
    metrics: SharedMetrics,
}

impl Notifier {
    pub fn new(
        subs: Arc<dyn SubscriptionStore>,
        config: NotifierConfig,
        metrics: SharedMetrics,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            subs,
            config,
            http,
            metrics,
        }
    }

    /// Fan one "queue became non-empty" hint out to the chosen subscribers.
    pub async fn queue_non_empty(&self, command: &str, queue_depth: u64) {
        let subs = match self.subs.live_subscriptions(command).await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(command, err = %e, "subscription lookup failed — notification dropped");
                return;
            }
        };
        if subs.is_empty() {
            return;
        }

        let chosen = self.select(command, subs).await;
        for (kind, sub) in chosen {
            match self.subs.notify_allowed(&sub.id, sub.min_interval_seconds).await {
                Ok(true) => {}
                Ok(false) => {
                    self.metrics.record_notification(kind, command, "rate_limited");
                    continue;
                }
                Err(e) => {
                    warn!(subscription_id = %sub.id, err = %e, "rate-limit check failed");
                    self.metrics.record_notification(kind, command, "error");
                    continue;
                }
            }
            self.send(kind, command, queue_depth, &sub).await;
        }
    }

    /// Bucket live subscriptions by delivery mode and pick the recipients.
    async fn select(
        &self,
        command: &str,
        subs: Vec<Subscription>,
    ) -> Vec<(&'static str, Subscription)> {
        let mut fanout = Vec::new();
        let mut groups: HashMap<String, Vec<Subscription>> = HashMap::new();
        let mut hashed = Vec::new();

        for sub in subs {
            match sub.delivery_mode {
                DeliveryMode::Fanout => fanout.push(sub),
                DeliveryMode::Group => {
                    let group = sub.group_id.clone().unwrap_or_default();
                    groups.entry(group).or_default().push(sub);
                }
                DeliveryMode::Hash => hashed.push(sub),
            }
        }

        let mut chosen: Vec<(&'static str, Subscription)> =
            fanout.into_iter().map(|s| ("fanout", s)).collect();

        for (group_id, members) in groups {
            // members arrive id-sorted; the counter makes the pick rotate.
            match self.subs.next_group_index(command, &group_id).await {
                Ok(counter) => {
                    let idx = (counter % members.len() as u64) as usize;
                    chosen.push(("group", members[idx].clone()));
                }
                Err(e) => {
                    warn!(command, group_id, err = %e, "group counter unavailable");
                    self.metrics.record_notification("group", command, "error");
                }
            }
        }

        if !hashed.is_empty() {
            // Deterministic: every replica picks the same subscriber within
            // a window, no shared state needed.
            let window = Utc::now().timestamp() / HASH_WINDOW_SECS;
            let idx = (window.rem_euclid(hashed.len() as i64)) as usize;
            chosen.push(("hash", hashed[idx].clone()));
        }

        chosen
    }

    async fn send(&self, kind: &'static str, command: &str, queue_depth: u64, sub: &Subscription) {
        let event = AvailabilityEvent {
            event_type: command,
            available: true,
            queue_depth,
            claim_url: &self.config.claim_url,
            sent_at: Utc::now(),
            notification_id: new_id(),
        };
        let body = match serde_json::to_string(&event) {
            Ok(body) => body,
            Err(e) => {
                warn!(err = %e, "availability payload serialization failed");
                return;
            }
        };

        let mut request = self
            .http
            .post(&sub.callback_url)
            .header("Content-Type", "application/json")
            .body(body.clone());
        if let Some(secret) = &self.config.secret {
            let ts = Utc::now().timestamp();
            request = request
                .header(signing::TIMESTAMP_HEADER, ts)
                .header(signing::SIGNATURE_HEADER, signing::sign(secret, ts, &body));
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(subscription_id = %sub.id, command, kind, "availability notification sent");
                self.metrics.record_notification(kind, command, "ok");
            }
            Ok(resp) => {
                warn!(
                    subscription_id = %sub.id,
                    status = %resp.status(),
                    "availability notification rejected"
                );
                self.metrics.record_notification(kind, command, "http_error");
            }
            Err(e) => {
                warn!(subscription_id = %sub.id, err = %e, "availability notification failed");
                self.metrics.record_notification(kind, command, "error");
            }
        }
    }
}
