//! Reconnect delay: exponential backoff with jitter.
//!
//! Delays start at 1 second, double on every failure up to 60 seconds, and
//! are spread by ±25% so that many clients do not redial in lockstep.

use std::time::Duration;

use rand::Rng;

/// Initial retry delay in seconds.
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Maximum retry delay in seconds.
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
            Duration::from_secs(MAX_RETRY_DELAY_SECS),
        )
    }
}

impl Backoff {
    /// Creates a backoff starting at `initial` and capped at `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the jittered delay for this attempt and doubles the base delay.
    pub fn next_delay(&mut self) -> Duration {
        let delay = add_jitter(self.current);
        self.increase();
        delay
    }

    /// The un-jittered delay the next call to [`Backoff::next_delay`] is based on.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Resets to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Doubles the delay up to the maximum.
    fn increase(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }
}

/// Adds ±25% jitter to a duration.
fn add_jitter(duration: Duration) -> Duration {
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * JITTER_FACTOR;
    if jitter_range <= 0.0 {
        return duration;
    }
    let jitter = rng.random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_up_to_max() {
        let mut backoff = Backoff::default();
        let mut bases = Vec::new();
        for _ in 0..8 {
            bases.push(backoff.current().as_secs());
            backoff.next_delay();
        }
        assert_eq!(bases, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_jitter_within_quarter() {
        for _ in 0..100 {
            let mut backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(60));
            let delay = backoff.next_delay().as_secs_f64();
            assert!((3.0..=5.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_initial_stays_zero() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
