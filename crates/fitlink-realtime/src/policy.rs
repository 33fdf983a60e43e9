//! Reconnect backoff state machine.
//!
//! Pure bookkeeping, no timers: the connection task asks for the next delay
//! and owns the actual sleep.  Keeping this separate makes the schedule
//! directly testable.

use std::time::Duration;

use fitlink_shared::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_CAP_SECS};

/// Tracks scheduled reconnect attempts for one connection.
///
/// The attempt counter starts at 1 and increments per *scheduled* attempt,
/// whether or not the attempt ends up executing.  After `max_attempts`
/// scheduled attempts without a successful connect the policy is exhausted
/// and refuses to schedule more; only a successful connect or a manual
/// reconnect resets it.
#[derive(Debug)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    exhausted: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            exhausted: false,
        }
    }

    /// Delay before the next scheduled attempt: `min(2^attempt, 60)` seconds.
    ///
    /// Returns `None` once the attempt budget is spent; the caller must then
    /// transition to `MaxRetriesReached`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted {
            return None;
        }
        if self.attempt >= self.max_attempts {
            self.exhausted = true;
            return None;
        }
        self.attempt += 1;
        let secs = 2u64
            .saturating_pow(self.attempt)
            .min(RECONNECT_DELAY_CAP_SECS);
        Some(Duration::from_secs(secs))
    }

    /// Reset after a successful connect or a manual reconnect request.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.exhausted = false;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of attempts scheduled since the last reset.
    pub fn attempts_scheduled(&self) -> u32 {
        self.attempt
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_schedule_is_capped_exponential() {
        let mut policy = ReconnectPolicy::default();
        let expected_secs = [2, 4, 8, 16, 32, 60, 60, 60, 60, 60];

        for (i, &secs) in expected_secs.iter().enumerate() {
            let delay = policy.next_delay().unwrap_or_else(|| {
                panic!("attempt {} should still be scheduled", i + 1);
            });
            assert_eq!(delay, Duration::from_secs(secs), "attempt {}", i + 1);
        }
    }

    #[test]
    fn test_no_attempt_after_budget_spent() {
        let mut policy = ReconnectPolicy::default();
        for _ in 0..10 {
            assert!(policy.next_delay().is_some());
        }

        assert!(policy.next_delay().is_none());
        assert!(policy.is_exhausted());
        // Still refuses on subsequent asks.
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn test_reset_clears_counter_and_terminal_flag() {
        let mut policy = ReconnectPolicy::default();
        while policy.next_delay().is_some() {}
        assert!(policy.is_exhausted());

        policy.reset();
        assert!(!policy.is_exhausted());
        assert_eq!(policy.attempts_scheduled(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_success_mid_schedule_restarts_backoff() {
        let mut policy = ReconnectPolicy::default();
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.attempts_scheduled(), 2);

        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
    }
}
