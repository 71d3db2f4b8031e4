use crate::domain::config::ReconnectPolicy;
use std::time::Duration;

/// Exponential reconnect delay.
///
/// The n-th consecutive failure waits `min(seed * 2^(n-1), cap)`. `None`
/// from [`Backoff::next_delay`] means reconnecting is disabled or the retry
/// budget is spent.
#[derive(Debug, Clone)]
pub struct Backoff {
    enabled: bool,
    seed: Duration,
    cap: Duration,
    max_retries: Option<u32>,
    failures: u32,
}

impl Backoff {
    pub fn new(seed: Duration, cap: Duration, max_retries: Option<u32>) -> Self {
        Self {
            enabled: true,
            seed,
            cap: cap.max(seed),
            max_retries,
            failures: 0,
        }
    }

    pub fn from_policy(policy: &ReconnectPolicy) -> Self {
        let mut backoff = Self::new(
            Duration::from_millis(policy.backoff_seed_ms),
            Duration::from_millis(policy.backoff_cap_ms),
            policy.max_retries,
        );
        backoff.enabled = policy.enabled;
        backoff
    }

    /// Consecutive failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);

        if !self.enabled {
            return None;
        }
        if let Some(max) = self.max_retries {
            if self.failures > max {
                return None;
            }
        }

        let shift = (self.failures - 1).min(31);
        let delay = self.seed.saturating_mul(1u32 << shift);
        Some(delay.min(self.cap))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
