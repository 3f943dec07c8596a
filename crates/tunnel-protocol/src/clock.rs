//! # Clocks
//!
//! A thin abstraction over wall-clock time so heartbeat and deadline logic
//! can be unit-tested without real sleeps. Production code uses
//! [`SystemClock`]; tests can substitute a [`Clock`] implementation that
//! advances on demand.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync + std::fmt::Debug {
    /// A monotonic instant, used for deadlines and heartbeat-miss detection.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, used for the
    /// `Heartbeat`/`HeartbeatAck` timestamp fields that cross the wire.
    fn unix_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_unix_millis_is_positive_and_monotonic_now_advances() {
        let clock = SystemClock;
        assert!(clock.unix_millis() > 0);
        let t0 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now() >= t0);
    }
}
