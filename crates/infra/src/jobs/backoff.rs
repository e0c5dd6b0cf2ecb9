//! Retry delay policy: exponential growth, capped, with symmetric jitter.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter.
///
/// `delay = min(max_delay, base_delay * 2^(attempt - 1))`, then scaled by a
/// factor drawn uniformly from `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction (0.0..=1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Pre-jitter delay for a 1-indexed attempt count.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        // 2^63 already exceeds any sane cap; clamp the exponent to stay finite.
        let exp = 2_f64.powi((attempt - 1).min(62) as i32);
        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }

    /// Delay for `attempt` with jitter drawn from `rng`.
    pub fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay_ms = self.base_delay_for(attempt).as_millis() as f64;
        if self.jitter <= 0.0 || delay_ms == 0.0 {
            return Duration::from_millis(delay_ms as u64);
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_millis((delay_ms * factor).round().max(0.0) as u64)
    }
}

/// Shared random source for jitter.
///
/// Seeded sources reproduce the same sequence of delays.
#[derive(Debug)]
pub struct JitterSource {
    rng: Mutex<StdRng>,
}

impl JitterSource {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    /// Jittered delay; falls back to the pre-jitter delay if the lock is poisoned.
    pub fn delay(&self, policy: &BackoffPolicy, attempt: u32) -> Duration {
        match self.rng.lock() {
            Ok(mut rng) => policy.jittered(attempt, &mut *rng),
            Err(_) => policy.base_delay_for(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1000), Duration::from_millis(300_000))
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let p = policy();
        assert_eq!(p.base_delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.base_delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.base_delay_for(3), Duration::from_millis(4000));
        assert_eq!(p.base_delay_for(4), Duration::from_millis(8000));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let p = policy();
        assert_eq!(p.base_delay_for(10), Duration::from_millis(300_000));
        assert_eq!(p.base_delay_for(500), Duration::from_millis(300_000));
    }

    #[test]
    fn fourth_attempt_jitters_within_quarter_band() {
        let p = policy();
        let source = JitterSource::from_entropy();
        for _ in 0..200 {
            let d = source.delay(&p, 4);
            assert!(d >= Duration::from_millis(6000) && d <= Duration::from_millis(10_000), "{d:?}");
        }
    }

    #[test]
    fn fixed_seed_reproduces_delays() {
        let p = policy();
        let a = JitterSource::seeded(42);
        let b = JitterSource::seeded(42);
        let left: Vec<_> = (1..=8).map(|n| a.delay(&p, n)).collect();
        let right: Vec<_> = (1..=8).map(|n| b.delay(&p, n)).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let p = policy().with_jitter(0.0);
        let source = JitterSource::from_entropy();
        assert_eq!(source.delay(&p, 3), Duration::from_millis(4000));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: jittered delay stays within ±25% of the capped exponential delay.
        #[test]
        fn jitter_stays_in_band(attempt in 1u32..40, seed in any::<u64>()) {
            let p = policy();
            let base = p.base_delay_for(attempt).as_millis() as f64;
            let mut rng = StdRng::seed_from_u64(seed);
            let d = p.jittered(attempt, &mut rng).as_millis() as f64;
            prop_assert!(d >= (base * 0.75).floor() && d <= (base * 1.25).ceil());
        }
    }
}
