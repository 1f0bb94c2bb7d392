//! Exponential backoff for relay reconnect attempts (§4.6: 1s -> 30s cap,
//! max 10 attempts before the session gives up and reports `Failed`).

use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempt: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { attempt: 0 }
    }
}

impl ReconnectPolicy {
    /// Returns the delay to wait before the next attempt, or `None` once
    /// `MAX_ATTEMPTS` has been exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= MAX_ATTEMPTS {
            return None;
        }
        let exp = 2u64.saturating_pow(self.attempt);
        let delay = INITIAL_DELAY.saturating_mul(exp as u32).min(MAX_DELAY);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(8)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(16)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut policy = ReconnectPolicy::default();
        for _ in 0..MAX_ATTEMPTS {
            assert!(policy.next_backoff().is_some());
        }
        assert_eq!(policy.next_backoff(), None);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut policy = ReconnectPolicy::default();
        policy.next_backoff();
        policy.next_backoff();
        policy.reset();
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(1)));
    }
}
