//! Truncated-exponential backoff with uniform jitter for reconnect
//! scheduling: base 1 s doubling up to a 30 s cap, plus [0, 1000) ms of
//! jitter, for a bounded number of attempts.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// The delay before the next attempt, or `None` once the attempt budget
    /// is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        let exp = self
            .config
            .base
            .checked_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.config.cap)
            .min(self.config.cap);
        self.attempt += 1;

        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        Some(exp + jitter)
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }

    /// Forget past failures after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: Duration::ZERO,
            ..BackoffConfig::default()
        }
    }

    #[test]
    fn doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_attempts: 8,
            ..no_jitter()
        });
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn attempt_budget_is_bounded() {
        let mut backoff = Backoff::new(no_jitter());
        for _ in 0..5 {
            assert!(backoff.next_delay().is_some());
        }
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts_made(), 5);
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delay = backoff.next_delay().unwrap();
        assert!(delay >= Duration::from_secs(1));
        assert!(delay < Duration::from_secs(2));
    }

    #[test]
    fn reset_restores_the_budget() {
        let mut backoff = Backoff::new(no_jitter());
        while backoff.next_delay().is_some() {}
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }
}
