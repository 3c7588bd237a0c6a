// Helpers for timestamps
//
// Austin Shafer - 2020
use std::time::Instant;

/// A monotonic clock in nanoseconds
///
/// GPU timestamps are converted into this time base so that they
/// can be compared against cpu timestamps in the timeline.
pub struct MonotonicClock {
    mc_base: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            mc_base: Instant::now(),
        }
    }

    /// Nanoseconds since this clock was created
    pub fn now_nsec(&self) -> u64 {
        self.mc_base.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now_nsec();
        let b = clock.now_nsec();
        assert!(b >= a);
    }
}
