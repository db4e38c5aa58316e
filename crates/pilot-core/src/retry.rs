// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use rand::Rng;

/// Exponential back-off with multiplicative jitter.
///
/// Base 500 ms, factor 2, jitter ±25%, cap 8 s.  The LLM port gets 4 tries
/// per turn, the computer port 2.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub cap: Duration,
    pub max_tries: u32,
}

impl RetryPolicy {
    pub fn llm() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            jitter: 0.25,
            cap: Duration::from_secs(8),
            max_tries: 4,
        }
    }

    pub fn computer() -> Self {
        Self { max_tries: 2, ..Self::llm() }
    }

    /// Delay before retry number `attempt` (1-based: the delay slept after
    /// the `attempt`-th failure).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(policy: RetryPolicy) -> RetryPolicy {
        RetryPolicy { jitter: 0.0, ..policy }
    }

    #[test]
    fn delays_double_until_the_cap() {
        let p = no_jitter(RetryPolicy::llm());
        assert_eq!(p.delay(1), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_millis(1000));
        assert_eq!(p.delay(3), Duration::from_millis(2000));
        // 500ms * 2^9 would be 256 s; capped at 8 s.
        assert_eq!(p.delay(10), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy::llm();
        for _ in 0..100 {
            let d = p.delay(2).as_secs_f64();
            assert!((0.75..=1.25).contains(&(d / 1.0)), "delay out of bounds: {d}");
        }
    }

    #[test]
    fn computer_policy_has_two_tries() {
        assert_eq!(RetryPolicy::computer().max_tries, 2);
        assert_eq!(RetryPolicy::llm().max_tries, 4);
    }
}
