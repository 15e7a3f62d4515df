// SPDX-License-Identifier: MIT
//! Server-side Lua primitives.
//!
//! Each script touches keys of a single (tenant, command) queue only —
//! atomicity is never required across queues.

use once_cell::sync::Lazy;
use redis::Script;

/// Claim-move: pop from the tail of a pending list into the in-progress set.
///
/// KEYS[1] = pending list, KEYS[2] = in-progress set.
/// ARGV[1] = maximum inner iterations.
///
/// A popped id already tracked in the in-progress set is a stale reference
/// (it slipped back into pending while still leased); it is discarded and the
/// pop retries, up to the iteration budget. Returns the claimed id or nil.
pub static CLAIM_MOVE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local limit = tonumber(ARGV[1])
for i = 1, limit do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        return nil
    end
    if redis.call('SADD', KEYS[2], id) == 1 then
        return id
    end
end
return nil
"#,
    )
});

/// Promote one due delayed entry into its pending tier.
///
/// KEYS[1] = delayed zset, KEYS[2] = target pending list.
/// ARGV[1] = task id.
///
/// The ZREM guard makes promotion race-safe: of any number of concurrent
/// claimers sweeping the same queue, exactly one observes the removal and
/// performs the push.
pub static PROMOTE_DELAYED: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#,
    )
});

