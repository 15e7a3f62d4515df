// SPDX-License-Identifier: MIT
//! Worker-availability subscription registry.
//!
//! Subscriptions are stored as records in a global hash plus one zset entry
//! per event type, scored by `expiresAt` — a range over `(now, +inf]` yields
//! only live subscribers. A ticker-driven janitor evicts entries whose score
//! fell behind the clock.
//!
//! The store also hosts the two notifier primitives that must be atomic
//! across replicas: the per-subscription rate-limit mark and the per
//! (command, group) round-robin counter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use ::redis::AsyncCommands;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::keyspace;
use crate::model::{new_id, DeliveryMode, Subscription};
use crate::store::Store;

/// How often the janitor sweeps, unless configured otherwise.
pub const DEFAULT_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(60);
/// Eviction batch bound per event type per pass.
const SWEEP_BATCH: usize = 500;

// ─── Creation ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct NewSubscription {
    pub callback_url: String,
    pub event_types: Vec<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub group_id: Option<String>,
    pub min_interval_seconds: u64,
    pub ttl_seconds: u64,
}

/// Validate and materialize a subscription record.
pub fn build_subscription(req: NewSubscription, now: DateTime<Utc>) -> CoreResult<Subscription> {
    let url = reqwest::Url::parse(&req.callback_url)
        .map_err(|e| CoreError::validation(format!("invalid callback url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CoreError::validation(
            "callback url scheme must be http or https",
        ));
    }
    if req.event_types.is_empty() {
        return Err(CoreError::validation("at least one event type is required"));
    }
    let delivery_mode = req.delivery_mode.unwrap_or_default();
    if delivery_mode == DeliveryMode::Group
        && req.group_id.as_deref().unwrap_or("").is_empty()
    {
        return Err(CoreError::validation(
            "group delivery requires a groupId",
        ));
    }
    if req.ttl_seconds == 0 {
        return Err(CoreError::validation("ttlSeconds must be positive"));
    }

    Ok(Subscription {
        id: new_id(),
        callback_url: req.callback_url,
        event_types: req.event_types,
        delivery_mode,
        group_id: req.group_id,
        min_interval_seconds: req.min_interval_seconds,
        expires_at: now + Duration::seconds(req.ttl_seconds as i64),
        created_at: now,
    })
}

// ─── Store trait ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create(&self, sub: Subscription) -> CoreResult<Subscription>;

    /// Renew `expires_at` (and the per-event zset scores) if the
    /// subscription still exists.
    async fn heartbeat(&self, id: &str, ttl_seconds: u64) -> CoreResult<Subscription>;

    /// Every subscription live for `event_type` (`expires_at > now`),
    /// ordered by id for deterministic selection.
    async fn live_subscriptions(&self, event_type: &str) -> CoreResult<Vec<Subscription>>;

    /// Advance the round-robin counter for `(command, group_id)` and return
    /// its previous value.
    async fn next_group_index(&self, command: &str, group_id: &str) -> CoreResult<u64>;

    /// Atomically decide-and-mark the per-subscription rate limit: true when
    /// a notification may be sent now.
    async fn notify_allowed(&self, subscription_id: &str, min_interval_seconds: u64)
        -> CoreResult<bool>;

    /// Remove expired entries across all event types, bounded per pass.
    async fn evict_expired(&self) -> CoreResult<u64>;
}

// ─── Redis-backed store ───────────────────────────────────────────────────────

/// Set of event types that ever had a subscriber — the janitor's work list.
fn sub_events_set() -> String {
    "codeq:subs:events".to_string()
}

pub struct RedisSubscriptionStore {
    store: Store,
}

impl RedisSubscriptionStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn load(
        &self,
        conn: &mut ::redis::aio::MultiplexedConnection,
        id: &str,
    ) -> CoreResult<Option<Subscription>> {
        let raw: Option<String> = conn.hget(keyspace::subscriptions_hash(), id).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SubscriptionStore for RedisSubscriptionStore {
    async fn create(&self, sub: Subscription) -> CoreResult<Subscription> {
        let mut conn = self.store.conn();
        let json = serde_json::to_string(&sub)?;
        let score = sub.expires_at.timestamp();

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        pipe.hset(keyspace::subscriptions_hash(), &sub.id, json).ignore();
        for event in &sub.event_types {
            pipe.zadd(keyspace::subs_zset(event), &sub.id, score).ignore();
            pipe.sadd(sub_events_set(), event).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        info!(subscription_id = %sub.id, events = ?sub.event_types, "subscription registered");
        Ok(sub)
    }

    async fn heartbeat(&self, id: &str, ttl_seconds: u64) -> CoreResult<Subscription> {
        let mut conn = self.store.conn();
        let mut sub = self
            .load(&mut conn, id)
            .await?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        sub.expires_at = Utc::now() + Duration::seconds(ttl_seconds.max(1) as i64);
        let json = serde_json::to_string(&sub)?;
        let score = sub.expires_at.timestamp();

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        pipe.hset(keyspace::subscriptions_hash(), id, json).ignore();
        for event in &sub.event_types {
            pipe.zadd(keyspace::subs_zset(event), id, score).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(sub)
    }

    async fn live_subscriptions(&self, event_type: &str) -> CoreResult<Vec<Subscription>> {
        let mut conn = self.store.conn();
        let now = Utc::now();
        let ids: Vec<String> = conn
            .zrangebyscore(
                keyspace::subs_zset(event_type),
                format!("({}", now.timestamp()),
                "+inf",
            )
            .await?;

        let mut subs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(sub) = self.load(&mut conn, &id).await? {
                if sub.expires_at > now {
                    subs.push(sub);
                }
            }
        }
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subs)
    }

    async fn next_group_index(&self, command: &str, group_id: &str) -> CoreResult<u64> {
        let mut conn = self.store.conn();
        let counter: i64 = conn
            .incr(keyspace::notify_group_counter(command, group_id), 1)
            .await?;
        Ok((counter - 1).max(0) as u64)
    }

    async fn notify_allowed(
        &self,
        subscription_id: &str,
        min_interval_seconds: u64,
    ) -> CoreResult<bool> {
        if min_interval_seconds == 0 {
            return Ok(true);
        }
        let mut conn = self.store.conn();
        // SET NX EX: first writer in the interval wins; everyone else is
        // rate-limited until the mark expires.
        let marked: Option<String> = ::redis::cmd("SET")
            .arg(keyspace::notify_rate_limit(subscription_id))
            .arg(Utc::now().timestamp())
            .arg("NX")
            .arg("EX")
            .arg(min_interval_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(marked.is_some())
    }

    async fn evict_expired(&self) -> CoreResult<u64> {
        let mut conn = self.store.conn();
        let now = Utc::now();
        let events: Vec<String> = conn.smembers(sub_events_set()).await?;

        let mut evicted = 0u64;
        for event in events {
            let zset = keyspace::subs_zset(&event);
            let expired: Vec<String> = conn
                .zrangebyscore_limit(&zset, "-inf", now.timestamp(), 0, SWEEP_BATCH as isize)
                .await?;
            for id in expired {
                let _: i64 = conn.zrem(&zset, &id).await?;
                // Drop the record only when it is expired on its own terms —
                // a heartbeat may have renewed it under another event type.
                if let Some(sub) = self.load(&mut conn, &id).await? {
                    if sub.expires_at <= now {
                        let _: i64 = conn.hdel(keyspace::subscriptions_hash(), &id).await?;
                    }
                }
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
struct MemSubsInner {
    subs: HashMap<String, Subscription>,
    counters: HashMap<(String, String), u64>,
    /// subscription id → instant the rate-limit mark expires.
    rate_marks: HashMap<String, DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemorySubscriptionStore {
    inner: Mutex<MemSubsInner>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn create(&self, sub: Subscription) -> CoreResult<Subscription> {
        let mut inner = self.inner.lock().await;
        inner.subs.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn heartbeat(&self, id: &str, ttl_seconds: u64) -> CoreResult<Subscription> {
        let mut inner = self.inner.lock().await;
        let sub = inner
            .subs
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        sub.expires_at = Utc::now() + Duration::seconds(ttl_seconds.max(1) as i64);
        Ok(sub.clone())
    }

    async fn live_subscriptions(&self, event_type: &str) -> CoreResult<Vec<Subscription>> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut subs: Vec<Subscription> = inner
            .subs
            .values()
            .filter(|s| s.expires_at > now && s.event_types.iter().any(|e| e == event_type))
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subs)
    }

    async fn next_group_index(&self, command: &str, group_id: &str) -> CoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let counter = inner
            .counters
            .entry((command.to_string(), group_id.to_string()))
            .or_insert(0);
        let index = *counter;
        *counter += 1;
        Ok(index)
    }

    async fn notify_allowed(
        &self,
        subscription_id: &str,
        min_interval_seconds: u64,
    ) -> CoreResult<bool> {
        if min_interval_seconds == 0 {
            return Ok(true);
        }
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        match inner.rate_marks.get(subscription_id) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                inner.rate_marks.insert(
                    subscription_id.to_string(),
                    now + Duration::seconds(min_interval_seconds as i64),
                );
                Ok(true)
            }
        }
    }

    async fn evict_expired(&self) -> CoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let before = inner.subs.len();
        inner.subs.retain(|_, s| s.expires_at > now);
        Ok((before - inner.subs.len()) as u64)
    }
}

// ─── Cleanup service ──────────────────────────────────────────────────────────

/// Background janitor — wakes on `interval` and evicts expired subscriptions.
/// Runs for the process lifetime; spawn with `tokio::spawn`.
pub async fn run_subscription_janitor(store: Arc<dyn SubscriptionStore>, interval: StdDuration) {
    info!(interval_secs = interval.as_secs(), "subscription janitor started");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate first tick

    loop {
        ticker.tick().await;
        match store.evict_expired().await {
            Ok(evicted) if evicted > 0 => {
                info!(evicted, "subscription janitor evicted expired entries");
            }
            Ok(_) => {}
            Err(e) => warn!(err = %e, "subscription janitor sweep failed"),
        }
    }
}
