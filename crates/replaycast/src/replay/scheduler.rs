//! Pacing rules for revealing frames.
//!
//! Frames are replayed with the gaps they were recorded with: the delay
//! before showing the next frame is the recorded timestamp delta divided by
//! the playback speed, clamped to keep degenerate feeds responsive.

use std::time::Duration;

/// How often the forward poller asks for frames past the newest known stamp.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long polling stays parked after the feed reports the event finished,
/// before one re-check for late corrections.
pub const TERMINAL_RECHECK: Duration = Duration::from_secs(30);

/// Floor for the per-step delay. Bursty feeds can record frames closer
/// together than a viewer can follow.
pub const MIN_STEP_DELAY: Duration = Duration::from_millis(250);

/// Ceiling for the per-step delay. Long recorded gaps (stoppages, feed
/// outages) are compressed rather than replayed in full.
pub const MAX_STEP_DELAY: Duration = Duration::from_secs(10);

/// Slowest supported playback speed.
pub const MIN_SPEED_FACTOR: f64 = 0.25;

/// Fastest supported playback speed.
pub const MAX_SPEED_FACTOR: f64 = 8.0;

/// Delay before revealing the frame at `next_stamp` after the one at
/// `prev_stamp`, at `speed` times real time.
pub fn step_delay(prev_stamp: i64, next_stamp: i64, speed: f64) -> Duration {
    let gap_ms = (next_stamp - prev_stamp).max(0) as f64;
    let scaled = gap_ms / clamp_speed(speed);
    Duration::from_millis(scaled as u64).clamp(MIN_STEP_DELAY, MAX_STEP_DELAY)
}

/// Clamps a requested speed factor into the supported range. Non-finite
/// input resets to real time.
pub fn clamp_speed(speed: f64) -> f64 {
    if !speed.is_finite() {
        return 1.0;
    }
    speed.clamp(MIN_SPEED_FACTOR, MAX_SPEED_FACTOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_delay_scales_with_speed() {
        // A 2s recorded gap at 2x replays in 1s.
        assert_eq!(step_delay(0, 2_000, 1.0), Duration::from_secs(2));
        assert_eq!(step_delay(0, 2_000, 2.0), Duration::from_secs(1));
        assert_eq!(step_delay(0, 2_000, 0.5), Duration::from_secs(4));
    }

    #[test]
    fn test_step_delay_clamped() {
        assert_eq!(step_delay(0, 1, 8.0), MIN_STEP_DELAY);
        assert_eq!(step_delay(0, 600_000, 1.0), MAX_STEP_DELAY);
    }

    #[test]
    fn test_step_delay_non_increasing_gap() {
        // Out-of-order or duplicate stamps never produce a negative wait.
        assert_eq!(step_delay(5_000, 5_000, 1.0), MIN_STEP_DELAY);
        assert_eq!(step_delay(5_000, 1_000, 1.0), MIN_STEP_DELAY);
    }

    #[test]
    fn test_clamp_speed() {
        assert_eq!(clamp_speed(1.0), 1.0);
        assert_eq!(clamp_speed(0.01), MIN_SPEED_FACTOR);
        assert_eq!(clamp_speed(100.0), MAX_SPEED_FACTOR);
        assert_eq!(clamp_speed(f64::NAN), 1.0);
        assert_eq!(clamp_speed(f64::INFINITY), 1.0);
    }
}
