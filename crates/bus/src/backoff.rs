//! Exponential backoff between reconnection attempts.
//!
//! When the session drops, retrying immediately can hammer a recovering
//! broker. The network thread instead sleeps an exponentially growing delay
//! between attempts:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With the defaults (initial 1 s, multiplier 1.1, cap 60 s) the first
//! retries are near-instant and a sustained outage settles at one attempt a
//! minute. The schedule is unbounded: the bus reconnects automatically for as
//! long as the process runs, and `reset()` restores the initial delay after a
//! successful CONNACK.

use std::time::Duration;

/// Backoff controller for the reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    /// Creates a controller with custom timing parameters.
    ///
    /// `multiplier` must be greater than 1.0 for the delay to grow; smaller
    /// values degenerate to a fixed `initial` delay.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier,
            attempt: 0,
        }
    }

    /// Restores the initial delay. Called after a successful connect so the
    /// next failure starts from the minimum again.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the delay to sleep before the next attempt and advances the
    /// schedule.
    pub fn next_sleep(&mut self) -> Duration {
        self.attempt += 1;
        let sleep = self.current_delay;

        let grown = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(grown).min(self.max_delay);

        sleep
    }

    /// Number of attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay the next `next_sleep()` call will return.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    /// Gentle defaults for broker reconnection: 1 s initial, 10% growth,
    /// 60 s cap. Most outages recover within the first few attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 1.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_initial_delay() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_sleep(), Duration::from_secs(1));
    }

    #[test]
    fn delay_grows_monotonically() {
        let mut backoff = Backoff::default();
        let first = backoff.next_sleep();
        let second = backoff.next_sleep();
        assert!(second > first);
        assert!(second < Duration::from_secs_f64(1.2));
    }

    #[test]
    fn delay_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = backoff.next_sleep();
        }
        assert_eq!(last, Duration::from_secs(10));
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = Backoff::default();
        backoff.next_sleep();
        backoff.next_sleep();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_sleep(), Duration::from_secs(1));
    }

    #[test]
    fn schedule_is_unbounded() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50), 1.5);
        for _ in 0..1000 {
            let delay = backoff.next_sleep();
            assert!(delay <= Duration::from_millis(50));
        }
        assert_eq!(backoff.attempt(), 1000);
    }
}
