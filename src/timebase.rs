//! Time helpers.
//!
//! Wall-clock nanoseconds are used for all published and recorded
//! timestamps; frame scheduling uses `std::time::Instant` deadlines and
//! never reads the wall clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch.
pub fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_is_nonzero_and_monotonic_enough() {
        let a = wall_clock_ns();
        let b = wall_clock_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
