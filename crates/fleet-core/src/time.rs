//! Wall-clock timestamps carried on the wire

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, or 0 if the clock reads earlier than that.
///
/// ```
/// assert!(fleet_core::time::current_time_millis() > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Source of heartbeat timestamps that never goes backwards.
///
/// Wall clocks can be stepped back (NTP, manual changes); reports from one
/// connection must still carry non-decreasing timestamps.
#[derive(Debug, Default)]
pub struct MonotonicMillis {
    last: u64,
}

impl MonotonicMillis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: the wall clock, clamped to the last value returned
    pub fn next(&mut self) -> u64 {
        self.observe(current_time_millis())
    }

    /// Clamp an observed wall-clock value to the last value returned
    pub fn observe(&mut self, wall: u64) -> u64 {
        self.last = self.last.max(wall);
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clamps_backwards_step() {
        let mut clock = MonotonicMillis::new();
        assert_eq!(clock.observe(1_000), 1_000);
        assert_eq!(clock.observe(900), 1_000);
        assert_eq!(clock.observe(1_500), 1_500);
    }

    #[test]
    fn test_next_tracks_wall_clock() {
        let mut clock = MonotonicMillis::new();
        let a = clock.next();
        let b = clock.next();
        assert!(a > 0);
        assert!(b >= a);
    }
}
