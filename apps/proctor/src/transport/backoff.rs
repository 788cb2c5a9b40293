use std::time::Duration;

/// Reconnect schedule: the delay doubles per failed attempt up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts
            .map(|limit| attempts >= limit)
            .unwrap_or(false)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

/// Reconnect state for one connection. Recomputed on every failure and
/// replaced wholesale on a successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub next_delay: Duration,
}

impl Backoff {
    pub fn initial(policy: &BackoffPolicy) -> Self {
        Self {
            attempts: 0,
            next_delay: policy.delay_for(0),
        }
    }

    pub fn after_failure(self, policy: &BackoffPolicy) -> Self {
        let attempts = self.attempts.saturating_add(1);
        Self {
            attempts,
            next_delay: policy.delay_for(attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_ceiling() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            max_attempts: None,
        };
        let mut backoff = Backoff::initial(&policy);
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(backoff.next_delay);
            backoff = backoff.after_failure(&policy);
        }
        assert_eq!(
            delays,
            [500, 1_000, 2_000, 4_000, 8_000, 10_000, 10_000, 10_000]
                .map(Duration::from_millis)
                .to_vec()
        );
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(backoff.attempts, 8);
    }

    #[test]
    fn huge_attempt_counts_saturate_at_the_ceiling() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), policy.max);
    }

    #[test]
    fn attempt_limit_is_optional() {
        let unbounded = BackoffPolicy::default();
        assert!(!unbounded.exhausted(10_000));

        let bounded = BackoffPolicy {
            max_attempts: Some(3),
            ..BackoffPolicy::default()
        };
        assert!(!bounded.exhausted(2));
        assert!(bounded.exhausted(3));
    }

    #[test]
    fn reset_after_open_starts_over() {
        let policy = BackoffPolicy::default();
        let worn = Backoff::initial(&policy)
            .after_failure(&policy)
            .after_failure(&policy);
        assert_eq!(worn.attempts, 2);
        assert_eq!(Backoff::initial(&policy).next_delay, policy.base);
    }
}
