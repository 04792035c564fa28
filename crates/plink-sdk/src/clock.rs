//! Wall-clock adjustment detection.
//!
//! The service wants to know when a timestamp series jumps because somebody
//! set the system clock (NTP sync, manual change). We track the offset
//! between wall time and a monotonic reference; when the offset moves more
//! than [`CLOCK_TOLERANCE`], the next request carries `Clock-Adjusted: 1`.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Offset drift below this is treated as noise.
pub const CLOCK_TOLERANCE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct ClockWatcher {
    reference: Instant,
    delta: f64,
}

pub(crate) fn wall_now() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

impl ClockWatcher {
    pub fn new() -> Self {
        let reference = Instant::now();
        Self {
            reference,
            delta: wall_now(),
        }
    }

    fn current_delta(&self) -> f64 {
        wall_now() - self.reference.elapsed().as_secs_f64()
    }

    /// Re-baseline after the adjustment has been reported.
    pub fn reset(&mut self) {
        self.delta = self.current_delta();
    }

    pub fn clock_adjusted(&self) -> bool {
        (self.delta - self.current_delta()).abs() >= CLOCK_TOLERANCE.as_secs_f64()
    }

    /// Pretend the wall clock jumped by `seconds` since the baseline.
    #[cfg(test)]
    pub(crate) fn shift_for_test(&mut self, seconds: f64) {
        self.delta -= seconds;
    }
}

impl Default for ClockWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_watcher_sees_no_adjustment() {
        let watcher = ClockWatcher::new();
        assert!(!watcher.clock_adjusted());
    }

    #[test]
    fn simulated_jump_is_detected_and_reset_clears_it() {
        let mut watcher = ClockWatcher::new();
        // Simulate the wall clock having jumped one hour since the baseline.
        watcher.delta -= 3600.0;
        assert!(watcher.clock_adjusted());
        watcher.reset();
        assert!(!watcher.clock_adjusted());
    }
}
