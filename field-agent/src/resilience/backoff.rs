//! Exponential backoff with bounded jitter.

use rand::Rng;
use std::time::Duration;

/// Fraction of the delay added as random jitter at most.
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_ratio: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    /// `min(base * 2^attempt, cap)` for a 0-based attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Base delay plus up to `jitter_ratio` of it, drawn from the thread RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = rng.gen_range(0.0..=self.jitter_ratio);
        delay + delay.mul_f64(jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_base_delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.base_delay(0), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(1), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(5), Duration::from_secs(32));
        assert_eq!(backoff.base_delay(6), Duration::from_secs(60));
        assert_eq!(backoff.base_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_is_monotonic_and_bounded() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        let bound = backoff.cap.mul_f64(1.0 + backoff.jitter_ratio);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let mut previous = Duration::ZERO;
            for attempt in 0..20 {
                let delay = backoff.delay_with(attempt, &mut rng);
                assert!(delay <= bound, "attempt {} gave {:?}", attempt, delay);
                if backoff.base_delay(attempt + 1) < backoff.cap {
                    assert!(previous <= delay);
                    previous = delay;
                }
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let backoff = Backoff {
            jitter_ratio: 0.0,
            ..Backoff::new(Duration::from_secs(300), Duration::from_secs(3600))
        };
        assert_eq!(backoff.delay(2), Duration::from_secs(1200));
    }
}
