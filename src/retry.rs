/// Bounded exponential backoff with jitter
///
/// Used by the producer for transient RPC/broker failures and by the
/// consumer pool when reconnecting. The cursor is never advanced while a
/// backoff is in progress.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Default policy for transient chain/broker failures: 1s doubling up
    /// to 60s.
    pub fn transient() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Next delay: base * 2^attempt, capped at max, with up to 25% jitter
    /// added so restarting fleets do not synchronize.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_range = capped.as_millis() as u64 / 4;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }

    /// Reset after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));

        // delay = capped + jitter, jitter <= 25% of capped
        let d0 = backoff.next_delay();
        assert!(d0 >= Duration::from_secs(1) && d0 <= Duration::from_millis(1250));

        let d1 = backoff.next_delay();
        assert!(d1 >= Duration::from_secs(2) && d1 <= Duration::from_millis(2500));

        let d2 = backoff.next_delay();
        assert!(d2 >= Duration::from_secs(4) && d2 <= Duration::from_secs(5));

        // capped from here on
        for _ in 0..10 {
            let d = backoff.next_delay();
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        let d = backoff.next_delay();
        assert!(d >= Duration::from_secs(1) && d <= Duration::from_millis(1250));
    }

    #[test]
    fn test_backoff_no_overflow_on_many_attempts() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_secs(75));
        }
    }
}
