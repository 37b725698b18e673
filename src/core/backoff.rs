use std::time::Duration;

use rand::Rng;

const MAX_EXPONENT: u32 = 16;

/// Capped exponential backoff with equal jitter.
///
/// Shared by the channel reconnect loop, the autosave flush path and the
/// submit path; each one owns its own attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: Option<u32>,
}

impl BackoffPolicy {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap: cap.max(base), max_attempts: None }
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub(crate) fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// True once `attempts` failed attempts used up the budget.
    pub(crate) fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Upper bound of the delay before retry number `attempt` (1-based).
    pub(crate) fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }

    /// Delay before retry number `attempt`, somewhere in `[ceiling/2, ceiling]`.
    pub(crate) fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let spread = u64::try_from((ceiling - half).as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rng.gen_range(0..=spread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn ceiling_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(4));
        assert_eq!(policy.ceiling(1), Duration::from_millis(500));
        assert_eq!(policy.ceiling(2), Duration::from_millis(1000));
        assert_eq!(policy.ceiling(3), Duration::from_millis(2000));
        assert_eq!(policy.ceiling(4), Duration::from_millis(4000));
        assert_eq!(policy.ceiling(10), Duration::from_millis(4000));
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_millis(4000));
    }

    #[test]
    fn delay_stays_within_jitter_window() {
        let policy = BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(10));
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..12 {
            let ceiling = policy.ceiling(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt, &mut rng);
                assert!(delay >= ceiling / 2, "{delay:?} below half of {ceiling:?}");
                assert!(delay <= ceiling, "{delay:?} above {ceiling:?}");
            }
        }
    }

    #[test]
    fn exhausted_respects_budget() {
        let unlimited = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2));
        assert!(!unlimited.exhausted(1_000));

        let limited = unlimited.with_max_attempts(3);
        assert!(!limited.exhausted(2));
        assert!(limited.exhausted(3));
        assert_eq!(limited.max_attempts(), Some(3));
    }

    #[test]
    fn cap_never_below_base() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.ceiling(3), Duration::from_secs(5));
    }
}
