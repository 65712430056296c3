//! Retry policy: bounded attempts with capped, jittered exponential backoff.
//!
//! The delay computation is a pure function so it can be tested without real
//! timers; the transport's retry loop is the only place that sleeps.

use std::time::Duration;

use rand::Rng;

/// Upper bound on the caller-specified retry budget.
pub const MAX_RETRY_BUDGET: u32 = 10;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first (0..=10).
    max_retries: u32,
    /// Unit of the exponential term. One second in production; tests shrink
    /// it to keep retry loops fast.
    pub base: Duration,
    /// Cap on the exponential term, in base units.
    pub cap_units: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            cap_units: 30,
        }
    }
}

impl RetryPolicy {
    /// Build a policy, rejecting budgets outside the validated range.
    pub fn new(max_retries: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(
            max_retries <= MAX_RETRY_BUDGET,
            "retry count {} outside the supported range 0..={}",
            max_retries,
            MAX_RETRY_BUDGET
        );
        Ok(Self {
            max_retries,
            ..Default::default()
        })
    }

    /// Replace the backoff unit. Tests shrink it to keep retry loops fast.
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before the next attempt. `attempt` is the 0-based index of the
    /// attempt that just failed.
    ///
    /// An explicit server Retry-After takes precedence; otherwise
    /// `min(2^attempt, cap) + random(0, that value)` base units.
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if let Some(secs) = retry_after_secs {
            return Duration::from_secs(secs);
        }
        let exp = 2f64.powi(attempt.min(30) as i32).min(self.cap_units as f64);
        let jitter = rand::thread_rng().gen_range(0.0..=exp);
        self.base.mul_f64(exp + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_range_is_validated() {
        assert!(RetryPolicy::new(0).is_ok());
        assert!(RetryPolicy::new(10).is_ok());
        assert!(RetryPolicy::new(11).is_err());
    }

    #[test]
    fn test_max_attempts_is_budget_plus_one() {
        assert_eq!(RetryPolicy::new(3).unwrap().max_attempts(), 4);
        assert_eq!(RetryPolicy::new(0).unwrap().max_attempts(), 1);
    }

    #[test]
    fn test_delay_stays_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..8 {
            let exp = 2f64.powi(attempt as i32).min(policy.cap_units as f64);
            let d = policy.delay_for(attempt, None).as_secs_f64();
            assert!(d >= exp, "attempt {}: {} < {}", attempt, d, exp);
            assert!(d <= 2.0 * exp, "attempt {}: {} > {}", attempt, d, 2.0 * exp);
        }
    }

    #[test]
    fn test_exponent_is_capped() {
        let policy = RetryPolicy::default();
        // 2^10 = 1024 would dwarf the 30-unit cap.
        let d = policy.delay_for(10, None).as_secs_f64();
        assert!(d <= 60.0);
    }

    #[test]
    fn test_retry_after_takes_precedence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(5, Some(7)), Duration::from_secs(7));
        assert_eq!(policy.delay_for(0, Some(0)), Duration::ZERO);
    }
}
