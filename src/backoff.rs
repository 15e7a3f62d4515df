// SPDX-License-Identifier: MIT
//! Retry backoff policies.
//!
//! [`delay_seconds`] is a pure function of `(policy, base, max, attempts)`
//! plus a caller-supplied RNG, so tests can pin the jitter. All policies cap
//! at `max`.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Always `base`.
    Fixed,
    /// `base * attempts`.
    Linear,
    /// `min(max, base * 2^attempts)`.
    Exponential,
    /// `uniform(0, min(max, base * 2^attempts))`.
    ExpFullJitter,
    /// `half + uniform(0, half)` where `half = min(max, base * 2^attempts) / 2`.
    ExpEqualJitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential
    }
}

impl std::str::FromStr for BackoffPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffPolicy::Fixed),
            "linear" => Ok(BackoffPolicy::Linear),
            "exponential" => Ok(BackoffPolicy::Exponential),
            "exp_full_jitter" => Ok(BackoffPolicy::ExpFullJitter),
            "exp_equal_jitter" => Ok(BackoffPolicy::ExpEqualJitter),
            other => Err(format!("unknown backoff policy '{other}'")),
        }
    }
}

/// `min(max, base * 2^attempts)` without overflow.
fn exp_ceiling(base: u64, max: u64, attempts: u32) -> u64 {
    // 2^63 already saturates any sane cap; avoid the shift overflow past that.
    let factor = 1u64.checked_shl(attempts.min(63)).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(max)
}

/// Compute the delay in seconds before the next attempt becomes visible.
///
/// `attempts` is the number of deliveries so far (1 after the first claim).
pub fn delay_seconds(
    policy: BackoffPolicy,
    base: u64,
    max: u64,
    attempts: u32,
    rng: &mut impl Rng,
) -> u64 {
    let delay = match policy {
        BackoffPolicy::Fixed => base,
        BackoffPolicy::Linear => base.saturating_mul(attempts as u64),
        BackoffPolicy::Exponential => exp_ceiling(base, max, attempts),
        BackoffPolicy::ExpFullJitter => {
            let ceiling = exp_ceiling(base, max, attempts);
            rng.gen_range(0..=ceiling)
        }
        BackoffPolicy::ExpEqualJitter => {
            let half = exp_ceiling(base, max, attempts) / 2;
            half + rng.gen_range(0..=half)
        }
    };
    delay.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    #[test]
    fn fixed_ignores_attempts() {
        let mut r = rng();
        assert_eq!(delay_seconds(BackoffPolicy::Fixed, 5, 900, 1, &mut r), 5);
        assert_eq!(delay_seconds(BackoffPolicy::Fixed, 5, 900, 9, &mut r), 5);
    }

    #[test]
    fn linear_scales_with_attempts() {
        let mut r = rng();
        assert_eq!(delay_seconds(BackoffPolicy::Linear, 5, 900, 3, &mut r), 15);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let mut r = rng();
        // base=5, attempts=1 → 10 (the literal nack-with-backoff case).
        assert_eq!(delay_seconds(BackoffPolicy::Exponential, 5, 900, 1, &mut r), 10);
        assert_eq!(delay_seconds(BackoffPolicy::Exponential, 5, 900, 2, &mut r), 20);
        // Far past the cap.
        assert_eq!(delay_seconds(BackoffPolicy::Exponential, 5, 900, 30, &mut r), 900);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut r = rng();
        assert_eq!(
            delay_seconds(BackoffPolicy::Exponential, u64::MAX, 900, 200, &mut r),
            900
        );
        assert_eq!(
            delay_seconds(BackoffPolicy::Linear, u64::MAX, 900, 200, &mut r),
            900
        );
    }

    proptest! {
        #[test]
        fn all_policies_cap_at_max(
            base in 0u64..10_000,
            max in 1u64..100_000,
            attempts in 0u32..64,
            seed in any::<u64>(),
        ) {
            let mut r = SmallRng::seed_from_u64(seed);
            for policy in [
                BackoffPolicy::Fixed,
                BackoffPolicy::Linear,
                BackoffPolicy::Exponential,
                BackoffPolicy::ExpFullJitter,
                BackoffPolicy::ExpEqualJitter,
            ] {
                prop_assert!(delay_seconds(policy, base, max, attempts, &mut r) <= max);
            }
        }

        #[test]
        fn equal_jitter_keeps_at_least_half(
            attempts in 0u32..10,
            seed in any::<u64>(),
        ) {
            let mut r = SmallRng::seed_from_u64(seed);
            let half = exp_ceiling(5, 900, attempts) / 2;
            let d = delay_seconds(BackoffPolicy::ExpEqualJitter, 5, 900, attempts, &mut r);
            prop_assert!(d >= half);
        }
    }
}
