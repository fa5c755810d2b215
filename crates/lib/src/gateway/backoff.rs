//! Reconnect delay: exponential from a base, capped, with optional jitter.

use std::time::Duration;

/// Reconnect policy (base delay, cap, jitter ratio in `0.0..=1.0`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that may be shaved off at random. 0 disables jitter.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Delay sequence for one run of reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            current: policy.base_delay.min(policy.max_delay),
            policy,
        }
    }

    /// Next delay to wait; doubles the following one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.policy.max_delay);
        apply_jitter(delay, self.policy.jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.policy.base_delay.min(self.policy.max_delay);
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return delay;
    }
    let mut bytes = [0u8; 4];
    if getrandom::getrandom(&mut bytes).is_err() {
        return delay;
    }
    let unit = u32::from_le_bytes(bytes) as f64 / u32::MAX as f64;
    delay.mul_f64(1.0 - jitter * unit)
}
