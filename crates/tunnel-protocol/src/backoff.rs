//! # Reconnect backoff
//!
//! Exponential backoff with jitter for the Agent's reconnect loop: base 1s,
//! factor 2, cap 30s, ±20% jitter. Each call to [`Backoff::next_delay`]
//! advances the sequence; [`Backoff::reset`] is called after a connection
//! attempt stays up long enough to be considered healthy.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            base,
            cap,
            factor,
            jitter,
            attempt: 0,
        }
    }

    /// The reconnect schedule: base 1s, factor 2, cap 30s, ±20% jitter.
    pub fn default_schedule() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, 0.2)
    }

    /// Returns the next delay and advances the internal attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let unjittered = self.base.as_secs_f64() * self.factor.powi(self.attempt as i32);
        let unjittered = unjittered.min(self.cap.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);

        let jitter_span = unjittered * self.jitter;
        let delta = fastrand::f64() * 2.0 * jitter_span - jitter_span;
        let jittered = (unjittered + delta).max(0.0);
        Duration::from_secs_f64(jittered)
    }

    /// Resets the schedule back to the first attempt, e.g. after a
    /// connection has been stable for a while.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let mut backoff = Backoff::default_schedule();
        let cap_with_jitter = Duration::from_secs(30).as_secs_f64() * 1.2;

        let mut last_unjittered_floor = 0.0f64;
        for _ in 0..12 {
            let delay = backoff.next_delay().as_secs_f64();
            assert!(delay <= cap_with_jitter + f64::EPSILON);
            // The underlying (pre-jitter) schedule itself never decreases,
            // even though any single jittered sample may dip slightly below
            // the previous jittered sample.
            let base_for_attempt =
                (1.0 * 2f64.powi((backoff.attempt() - 1) as i32)).min(30.0);
            assert!(base_for_attempt + f64::EPSILON >= last_unjittered_floor);
            last_unjittered_floor = base_for_attempt;
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::default_schedule();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
