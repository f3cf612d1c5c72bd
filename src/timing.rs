use std::time::Duration;

/// Converts between wall-clock time and remote playback ticks.
///
/// A tick is the remote process's unit of playback progress. At 1x speed the
/// remote advances `ticks_per_sec` ticks every second, so all extrapolation
/// in this crate goes through this type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickRate {
    ticks_per_sec: f64,
}

impl TickRate {
    /// Create a new TickRate for the given nominal ticks per second.
    pub fn new(ticks_per_sec: f64) -> Self {
        Self { ticks_per_sec }
    }

    /// The nominal rate in ticks per second at 1x speed.
    pub fn ticks_per_sec(&self) -> f64 {
        self.ticks_per_sec
    }

    /// Convert a tick count to seconds of 1x playback.
    pub fn ticks_to_secs(&self, ticks: u64) -> f64 {
        ticks as f64 / self.ticks_per_sec
    }

    /// Fractional number of ticks expected over `elapsed` at `speed`.
    pub fn expected_ticks(&self, elapsed: Duration, speed: f64) -> f64 {
        elapsed.as_secs_f64() * self.ticks_per_sec * speed
    }

    /// Whole ticks elapsed over `elapsed` at `speed`, rounded down.
    ///
    /// Non-finite or negative products yield zero.
    pub fn whole_ticks(&self, elapsed: Duration, speed: f64) -> u64 {
        let ticks = self.expected_ticks(elapsed, speed);
        if ticks.is_finite() && ticks > 0.0 {
            ticks.floor() as u64
        } else {
            0
        }
    }

    /// Convert a measured rate in ticks per second into a speed multiplier.
    pub fn speed_of(&self, measured_ticks_per_sec: f64) -> f64 {
        measured_ticks_per_sec / self.ticks_per_sec
    }

    /// Render a tick count as an `H:MM:SS` playback clock.
    pub fn clock_label(&self, ticks: u64) -> String {
        let total = self.ticks_to_secs(ticks).max(0.0) as u64;
        format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
    }
}

impl Default for TickRate {
    fn default() -> Self {
        Self::new(64.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_to_secs() {
        let rate = TickRate::new(64.0);
        assert!((rate.ticks_to_secs(32) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_whole_ticks_floors() {
        let rate = TickRate::new(64.0);
        assert_eq!(rate.whole_ticks(Duration::from_millis(500), 1.0), 32);
        // 0.51s * 64 = 32.64
        assert_eq!(rate.whole_ticks(Duration::from_millis(510), 1.0), 32);
        assert_eq!(rate.whole_ticks(Duration::from_secs(1), 0.25), 16);
        assert_eq!(rate.whole_ticks(Duration::ZERO, 1.0), 0);
    }

    #[test]
    fn test_whole_ticks_rejects_non_finite() {
        let rate = TickRate::new(64.0);
        assert_eq!(rate.whole_ticks(Duration::from_secs(1), f64::NAN), 0);
        assert_eq!(rate.whole_ticks(Duration::from_secs(1), -2.0), 0);
    }

    #[test]
    fn test_clock_label() {
        let rate = TickRate::new(64.0);
        assert_eq!(rate.clock_label(0), "0:00:00");
        assert_eq!(rate.clock_label(64 * 195), "0:03:15");
        assert_eq!(rate.clock_label(64 * 3725), "1:02:05");
    }

    #[test]
    fn test_speed_of() {
        let rate = TickRate::new(64.0);
        assert!((rate.speed_of(128.0) - 2.0).abs() < 1e-9);
        assert!((rate.speed_of(16.0) - 0.25).abs() < 1e-9);
    }
}
