// SPDX-License-Identifier: MIT
//! Two-generation rotating bloom filters.
//!
//! Two independent instances run in process memory: the idempotency filter
//! (accelerates negative lookups for fresh idempotency keys) and the ghost
//! filter (shortcuts ids whose task hash was deleted by admin cleanup).
//! Neither is authoritative — every answer is double-checked against the
//! store, so divergence between replicas is harmless.
//!
//! Rotation: on a fixed interval the "current" filter becomes "previous", a
//! fresh "current" replaces it, and the oldest generation is dropped. Lookup
//! consults both generations.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use bloomfilter::Bloom;
use tracing::warn;

/// Fallback sizing when the configured parameters are unusable.
pub const DEFAULT_CAPACITY: usize = 1_000_000;
pub const DEFAULT_FP_RATE: f64 = 0.01;
/// Default generation lifetime.
pub const DEFAULT_ROTATE_EVERY: Duration = Duration::from_secs(30 * 60);

struct Generations {
    current: Bloom<str>,
    previous: Option<Bloom<str>>,
    rotated_at: Instant,
}

/// A mutex-guarded, generation-rotating bloom filter over string keys.
pub struct RotatingBloom {
    capacity: usize,
    fp_rate: f64,
    rotate_every: Duration,
    inner: Mutex<Generations>,
}

impl RotatingBloom {
    /// Build a filter. Invalid parameters (zero capacity, fp rate outside
    /// (0, 1)) fall back to 1,000,000 / 0.01.
    pub fn new(capacity: usize, fp_rate: f64, rotate_every: Duration) -> Self {
        let (capacity, fp_rate) = if capacity == 0 || !(fp_rate > 0.0 && fp_rate < 1.0) {
            warn!(
                capacity,
                fp_rate, "invalid bloom parameters — using defaults"
            );
            (DEFAULT_CAPACITY, DEFAULT_FP_RATE)
        } else {
            (capacity, fp_rate)
        };
        let rotate_every = if rotate_every.is_zero() {
            DEFAULT_ROTATE_EVERY
        } else {
            rotate_every
        };
        Self {
            capacity,
            fp_rate,
            rotate_every,
            inner: Mutex::new(Generations {
                current: Bloom::new_for_fp_rate(capacity, fp_rate),
                previous: None,
                rotated_at: Instant::now(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_FP_RATE, DEFAULT_ROTATE_EVERY)
    }

    fn rotate_if_due(&self, gens: &mut Generations) {
        if gens.rotated_at.elapsed() < self.rotate_every {
            return;
        }
        let fresh = Bloom::new_for_fp_rate(self.capacity, self.fp_rate);
        gens.previous = Some(std::mem::replace(&mut gens.current, fresh));
        gens.rotated_at = Instant::now();
    }

    /// Record a key in the current generation.
    pub fn insert(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        let mut gens = self.inner.lock().expect("bloom mutex poisoned");
        self.rotate_if_due(&mut gens);
        gens.current.set(key);
    }

    /// Probabilistic membership: `false` means definitely absent, `true`
    /// means possibly present. Empty keys are conservatively present.
    pub fn maybe_contains(&self, key: &str) -> bool {
        if key.is_empty() {
            return true;
        }
        let mut gens = self.inner.lock().expect("bloom mutex poisoned");
        self.rotate_if_due(&mut gens);
        gens.current.check(key) || gens.previous.as_ref().is_some_and(|p| p.check(key))
    }

    /// Force a rotation now. Test hook.
    #[cfg(test)]
    fn force_rotate(&self) {
        let mut gens = self.inner.lock().expect("bloom mutex poisoned");
        let fresh = Bloom::new_for_fp_rate(self.capacity, self.fp_rate);
        gens.previous = Some(std::mem::replace(&mut gens.current, fresh));
        gens.rotated_at = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_key_reports_definitely_absent() {
        let bloom = RotatingBloom::new(1000, 0.01, Duration::from_secs(60));
        assert!(!bloom.maybe_contains("never-inserted"));
    }

    #[test]
    fn inserted_key_reports_possibly_present() {
        let bloom = RotatingBloom::new(1000, 0.01, Duration::from_secs(60));
        bloom.insert("k-1");
        assert!(bloom.maybe_contains("k-1"));
    }

    #[test]
    fn empty_key_is_conservatively_present() {
        let bloom = RotatingBloom::new(1000, 0.01, Duration::from_secs(60));
        assert!(bloom.maybe_contains(""));
    }

    #[test]
    fn invalid_parameters_fall_back_to_defaults() {
        let bloom = RotatingBloom::new(0, 5.0, Duration::from_secs(60));
        assert_eq!(bloom.capacity, DEFAULT_CAPACITY);
        assert!((bloom.fp_rate - DEFAULT_FP_RATE).abs() < f64::EPSILON);
    }

    #[test]
    fn one_rotation_keeps_keys_visible_via_previous_generation() {
        let bloom = RotatingBloom::new(1000, 0.01, Duration::from_secs(3600));
        bloom.insert("survivor");
        bloom.force_rotate();
        assert!(bloom.maybe_contains("survivor"));
    }

    #[test]
    fn two_rotations_drop_the_oldest_generation() {
        let bloom = RotatingBloom::new(1000, 0.01, Duration::from_secs(3600));
        bloom.insert("stale");
        bloom.force_rotate();
        bloom.force_rotate();
        assert!(!bloom.maybe_contains("stale"));
    }

    proptest::proptest! {
        // No false negatives, with or without one rotation in between.
        #[test]
        fn inserted_keys_are_always_possibly_present(
            keys in proptest::collection::vec("[a-z0-9]{1,32}", 1..50),
            rotate: bool,
        ) {
            let bloom = RotatingBloom::new(10_000, 0.01, Duration::from_secs(3600));
            for key in &keys {
                bloom.insert(key);
            }
            if rotate {
                bloom.force_rotate();
            }
            for key in &keys {
                proptest::prop_assert!(bloom.maybe_contains(key));
            }
        }
    }
}
