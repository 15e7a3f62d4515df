// SPDX-License-Identifier: MIT
//! Persisted key layout.
//!
//! Every key lives under the `codeq:` namespace. Queue keys embed
//! `(command, tenant)`; when the tenant is empty the legacy single-tenant
//! layout (no tenant segment) is used so queues written before multi-tenancy
//! keep draining. Priority is the terminal segment of pending-list keys so a
//! claim can sweep tiers independently.

/// Highest priority tier (inclusive). Priorities are clamped to `0..=9`.
pub const MAX_PRIORITY: u8 = 9;

/// Global hash: task id → task JSON.
pub fn tasks_hash() -> String {
    "codeq:tasks".to_string()
}

/// Global hash: task id → result JSON.
pub fn results_hash() -> String {
    "codeq:results".to_string()
}

/// Global zset: task id → retention cutoff (epoch seconds).
pub fn retention_zset() -> String {
    "codeq:tasks:ttl".to_string()
}

/// Expiring string: lease owner for a task. TTL = granted lease seconds.
pub fn lease(task_id: &str) -> String {
    format!("codeq:lease:{task_id}")
}

/// Expiring string: idempotency key → task id. TTL = retention window.
pub fn idempotency(key: &str) -> String {
    format!("codeq:idempo:{key}")
}

/// Set of every command ever enqueued. Feeds claim-with-empty-commands,
/// admin queue listing, and the orphan pass of retention cleanup.
pub fn commands_set() -> String {
    "codeq:commands".to_string()
}

fn queue_prefix(command: &str, tenant_id: &str) -> String {
    if tenant_id.is_empty() {
        format!("codeq:q:{command}")
    } else {
        format!("codeq:q:{command}:{tenant_id}")
    }
}

/// List of pending task ids for one priority tier (head = newest).
pub fn pending_list(command: &str, tenant_id: &str, priority: u8) -> String {
    format!("{}:pending:{priority}", queue_prefix(command, tenant_id))
}

/// Set of task ids currently leased for this queue.
pub fn in_progress_set(command: &str, tenant_id: &str) -> String {
    format!("{}:inprog", queue_prefix(command, tenant_id))
}

/// Zset of task id → visibility timestamp (epoch seconds).
pub fn delayed_zset(command: &str, tenant_id: &str) -> String {
    format!("{}:delayed", queue_prefix(command, tenant_id))
}

/// Set of task ids that exhausted their attempts.
pub fn dlq_set(command: &str, tenant_id: &str) -> String {
    format!("{}:dlq", queue_prefix(command, tenant_id))
}

/// Global hash: subscription id → subscription JSON.
pub fn subscriptions_hash() -> String {
    "codeq:subscriptions".to_string()
}

/// Per-event-type zset: subscription id → expiresAt (epoch seconds).
pub fn subs_zset(event_type: &str) -> String {
    format!("codeq:subs:{event_type}")
}

/// Expiring string marking "a notification was sent recently" for one
/// subscription. TTL = the subscription's minIntervalSeconds.
pub fn notify_rate_limit(subscription_id: &str) -> String {
    format!("codeq:notify:rl:{subscription_id}")
}

/// Round-robin counter for group delivery, per (command, group).
pub fn notify_group_counter(command: &str, group_id: &str) -> String {
    format!("codeq:notify:rr:{command}:{group_id}")
}

/// Clamp a raw priority into the supported range.
pub fn clamp_priority(priority: i64) -> u8 {
    priority.clamp(0, MAX_PRIORITY as i64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_keys_embed_tenant_segment() {
        assert_eq!(
            pending_list("PROCESS_ORDER", "acme", 5),
            "codeq:q:PROCESS_ORDER:acme:pending:5"
        );
        assert_eq!(
            in_progress_set("PROCESS_ORDER", "acme"),
            "codeq:q:PROCESS_ORDER:acme:inprog"
        );
        assert_eq!(
            delayed_zset("PROCESS_ORDER", "acme"),
            "codeq:q:PROCESS_ORDER:acme:delayed"
        );
        assert_eq!(dlq_set("PROCESS_ORDER", "acme"), "codeq:q:PROCESS_ORDER:acme:dlq");
    }

    #[test]
    fn empty_tenant_uses_legacy_layout() {
        assert_eq!(pending_list("ingest", "", 9), "codeq:q:ingest:pending:9");
        assert_eq!(in_progress_set("ingest", ""), "codeq:q:ingest:inprog");
        assert_eq!(delayed_zset("ingest", ""), "codeq:q:ingest:delayed");
    }

    #[test]
    fn priority_clamps_to_supported_range() {
        assert_eq!(clamp_priority(-3), 0);
        assert_eq!(clamp_priority(4), 4);
        assert_eq!(clamp_priority(42), 9);
    }
}
