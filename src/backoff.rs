//! Reconnect delay policy.

use std::time::Duration;

use rand::Rng as _;

/// Exponential reconnect delay: `base * 2^(attempt - 1)`.
///
/// Uncapped and jitter-free unless [`Backoff::with_max_delay`] or [`Backoff::with_jitter`]
/// are applied.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Option<Duration>,
    pub jitter: Option<Duration>,
}

impl Backoff {
    #[must_use]
    pub const fn new(base: Duration) -> Self {
        Self {
            base,
            max_delay: None,
            jitter: None,
        }
    }

    /// Caps the exponential component.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Adds a uniformly random delay in `[0, jitter]` on top of the exponential component.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: Option<Duration>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-indexed). Attempt `0` is treated as `1`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let mut delay = 2_u32
            .checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(Duration::MAX);

        if let Some(max) = self.max_delay {
            delay = delay.min(max);
        }

        match self.jitter {
            Some(jitter) if !jitter.is_zero() => {
                let extra = rand::rng().random_range(Duration::ZERO..=jitter);
                delay.saturating_add(extra)
            }
            _ => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let backoff = Backoff::new(Duration::from_millis(1000));

        for attempt in 1..=5 {
            assert_eq!(
                backoff.delay(attempt),
                Duration::from_millis(1000 * 2_u64.pow(attempt - 1)),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn attempt_zero_uses_base() {
        let backoff = Backoff::new(Duration::from_millis(250));
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let backoff = Backoff::new(Duration::from_secs(1));
        assert_eq!(backoff.delay(200), Duration::MAX);
    }

    #[test]
    fn backoff_respects_max() {
        let backoff = Backoff::new(Duration::from_secs(1))
            .with_max_delay(Some(Duration::from_secs(10)));

        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(30), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::new(Duration::from_secs(2))
            .with_max_delay(Some(Duration::from_secs(5)))
            .with_jitter(Some(Duration::from_millis(500)));

        for _ in 0..100 {
            let delay = backoff.delay(10);
            assert!(
                delay >= Duration::from_secs(5) && delay <= Duration::from_millis(5500),
                "delay out of range: {delay:?}"
            );
        }
    }
}
