//! Retry backoff policy.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with clamping and optional jitter.
///
/// The delay for attempt `n` (1-indexed) is
/// `initial_delay * backoff_factor^(n-1)`, clamped to `max_delay`; with
/// jitter enabled the result is scaled by a uniform factor in [0.5, 1.5).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A zero-delay policy for tests.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base_ms = self.initial_delay.as_millis() as f64
            * self.backoff_factor.powi(exponent as i32);
        let clamped = base_ms.min(self.max_delay.as_millis() as f64);
        let final_ms = if self.jitter {
            clamped * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            clamped
        };
        Duration::from_millis(final_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(500),
            jitter: false,
        }
    }

    #[test]
    fn doubles_per_attempt_and_clamps() {
        let p = no_jitter();
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(p.delay_for_attempt(20), Duration::from_millis(500));
    }

    #[test]
    fn defaults_match_contract() {
        let p = RetryPolicy::default();
        assert_eq!(p.initial_delay, Duration::from_secs(1));
        assert_eq!(p.backoff_factor, 2.0);
        assert_eq!(p.max_delay, Duration::from_secs(60));
        assert!(p.jitter);
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let p = RetryPolicy {
            jitter: true,
            ..no_jitter()
        };
        for _ in 0..100 {
            let d = p.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(50), "delay too small: {d:?}");
            assert!(d < Duration::from_millis(150), "delay too large: {d:?}");
        }
    }

    #[test]
    fn immediate_policy_is_zero() {
        assert_eq!(RetryPolicy::immediate().delay_for_attempt(1), Duration::ZERO);
        assert_eq!(RetryPolicy::immediate().delay_for_attempt(9), Duration::ZERO);
    }
}
