//! Retry policy for the notification channel.
//!
//! Two separate mechanisms:
//! - [`ReconnectController`] governs retries of a failed initial connect:
//!   exponential backoff `min(base * 2^attempt, max)`, bounded by `max_attempts`.
//! - [`LiveReconnectSchedule`] governs recovery after an established link
//!   drops: a fixed list of delays, one attempt per entry.

use std::time::Duration;

/// Default number of automatic retries after a failed initial connect
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the retry that follows `attempt` prior consecutive failures
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }
}

/// Consecutive-failure counter for the initial-connect path.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay before the next retry, or `None` once `max_attempts`
    /// retries have already been scheduled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

impl Default for ReconnectController {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

/// Delays used after an established link drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveReconnectSchedule {
    delays: Vec<Duration>,
}

impl LiveReconnectSchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// No automatic recovery; a drop goes straight to `Disconnected`
    pub fn disabled() -> Self {
        Self { delays: Vec::new() }
    }

    /// Delay before reconnect attempt `index`, `None` when the schedule is spent
    pub fn delay(&self, index: usize) -> Option<Duration> {
        self.delays.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

impl Default for LiveReconnectSchedule {
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delay_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7).map(|a| policy.delay_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_controller_bounds_retries() {
        let mut controller = ReconnectController::default();
        let mut scheduled = Vec::new();
        while let Some(delay) = controller.next_delay() {
            scheduled.push(delay.as_millis() as u64);
        }
        assert_eq!(scheduled, vec![1000, 2000, 4000, 8000, 16_000]);
        assert!(controller.is_exhausted());
        assert_eq!(controller.attempts(), 5);
        assert_eq!(controller.next_delay(), None);
        assert_eq!(controller.attempts(), 5);
    }

    #[test]
    fn test_controller_reset() {
        let mut controller = ReconnectController::default();
        controller.next_delay();
        controller.next_delay();
        controller.reset();
        assert_eq!(controller.attempts(), 0);
        assert_eq!(controller.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_max_attempts_never_retries() {
        let mut controller = ReconnectController::new(ReconnectPolicy {
            max_attempts: 0,
            ..Default::default()
        });
        assert_eq!(controller.next_delay(), None);
    }

    #[test]
    fn test_live_schedule() {
        let schedule = LiveReconnectSchedule::default();
        assert_eq!(schedule.delay(0), Some(Duration::ZERO));
        assert_eq!(schedule.delay(3), Some(Duration::from_secs(30)));
        assert_eq!(schedule.delay(4), None);
        assert!(LiveReconnectSchedule::disabled().is_empty());
    }

    proptest! {
        #[test]
        fn prop_delay_matches_formula(attempt in 0u32..64) {
            let policy = ReconnectPolicy::default();
            let expected = if attempt >= 5 { 30_000 } else { 1000u64 << attempt };
            prop_assert_eq!(policy.delay_for(attempt).as_millis() as u64, expected);
        }

        #[test]
        fn prop_attempts_never_exceed_max(max in 0u32..10, failures in 0usize..40) {
            let mut controller = ReconnectController::new(ReconnectPolicy {
                max_attempts: max,
                ..Default::default()
            });
            let mut retries = 0u32;
            for _ in 0..failures {
                if controller.next_delay().is_some() {
                    retries += 1;
                }
                prop_assert!(controller.attempts() <= max);
            }
            prop_assert!(retries <= max);
        }
    }
}
