//! Monotonic time source.
//!
//! All deadlines, release times, runtime measurements, and watchdog timers
//! share one time base: seconds since the clock was created, as `f64`.
//! The clock is backed by [`Instant`] and never goes backwards.

use std::time::{Duration, Instant};

/// Monotonic high-resolution clock.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed since the clock was created.
    #[must_use]
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// The instant corresponding to `seconds` on this clock's time base.
    ///
    /// Saturates at the origin for negative values.
    #[must_use]
    pub fn instant_at(&self, seconds: f64) -> Instant {
        if seconds <= 0.0 {
            return self.origin;
        }
        self.origin + Duration::from_secs_f64(seconds)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
