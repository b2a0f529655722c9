// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exponential reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Reconnect schedule: `min(base * 2^(attempt-1), cap)` for attempts
/// `1..=max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl ReconnectPolicy {
    /// Deterministic delay before reconnect attempt `attempt` (1-based).
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }

    /// Delay for `attempt`, or `None` once the attempt budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let delay = self.delay(attempt);
        if !self.jitter {
            return Some(delay);
        }
        let scale: f64 = rand::rng().random_range(0.5..=1.0);
        Some(delay.mul_f64(scale))
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
