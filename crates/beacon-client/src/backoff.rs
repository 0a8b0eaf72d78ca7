use std::time::Duration;

use rand::Rng;

/// Reconnection schedule: `min(max, base * 2^(attempt-1) + jitter)` with
/// jitter uniform in `[0, jitter)`, for attempts `1..=max_attempts`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            max: Duration::from_millis(30_000),
            max_attempts: 10,
            jitter: Duration::from_millis(1_000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before `attempt` without jitter. `attempt` starts at 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp)
    }

    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        self.max.min(self.base_delay(attempt).saturating_add(jitter))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.delay_with_jitter(attempt, jitter)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// Attempt counter over a [`BackoffPolicy`].
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Advance to the next attempt. `None` once the ceiling is passed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        self.policy
            .allows(self.attempt)
            .then(|| self.policy.delay(self.attempt))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn first_five_attempts_double() {
        let policy = BackoffPolicy::default();
        let expected = [1_000, 2_000, 4_000, 8_000, 16_000];
        for (i, want) in expected.iter().enumerate() {
            let attempt = i as u32 + 1;
            assert_eq!(policy.delay_with_jitter(attempt, Duration::ZERO), ms(*want));
            assert_eq!(policy.delay_with_jitter(attempt, ms(999)), ms(want + 999));
        }
    }

    #[test]
    fn random_jitter_stays_in_range() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=5 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let d = policy.delay(attempt);
                assert!(d >= base && d < base + ms(1_000), "attempt {attempt}: {d:?}");
            }
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_with_jitter(6, ms(500)), ms(30_000));
        assert_eq!(policy.delay_with_jitter(10, Duration::ZERO), ms(30_000));
        assert_eq!(policy.delay_with_jitter(64, Duration::ZERO), ms(30_000));
    }

    #[test]
    fn eleventh_attempt_is_refused() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        for _ in 0..10 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.attempt(), 10);
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 11);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::new(BackoffPolicy {
            jitter: Duration::ZERO,
            ..Default::default()
        });
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(ms(1_000)));
    }
}
