//! Reconnect backoff
//!
//! Exponential delays from 100 ms doubling up to a 5 s cap, jittered
//! ±20 % so a fleet of subscribers does not hammer a restarting producer
//! in lockstep.

use std::time::Duration;

use rand::Rng;

/// Initial reconnect delay
pub const BASE_DELAY: Duration = Duration::from_millis(100);

/// Delay cap
pub const MAX_DELAY: Duration = Duration::from_secs(5);

/// Jitter fraction applied to every delay
const JITTER: f64 = 0.2;

/// Exponential backoff state for one connection
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Standard reconnect schedule: 100 ms → 5 s, ±20 %
    pub fn new() -> Self {
        Backoff {
            base: BASE_DELAY,
            cap: MAX_DELAY,
            attempt: 0,
        }
    }

    /// Custom schedule (tests use short delays)
    pub fn with_bounds(base: Duration, cap: Duration) -> Self {
        Backoff {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        exp.mul_f64(jitter)
    }

    /// Attempts made since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset after a successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_doubles_to_cap() {
        let mut b = Backoff::new();
        let mut last = Duration::ZERO;
        for i in 0..10 {
            let d = b.next_delay();
            let nominal = BASE_DELAY.saturating_mul(1 << i).min(MAX_DELAY);
            assert!(d >= nominal.mul_f64(1.0 - JITTER), "attempt {i}: {d:?}");
            assert!(d <= nominal.mul_f64(1.0 + JITTER), "attempt {i}: {d:?}");
            if nominal < MAX_DELAY {
                assert!(d > last.mul_f64(1.0 - 2.0 * JITTER));
            }
            last = d;
        }
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut b = Backoff::new();
        for _ in 0..6 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.attempt(), 0);
        let d = b.next_delay();
        assert!(d <= BASE_DELAY.mul_f64(1.0 + JITTER));
    }
}
