//! Reconciles the device clock with the logical playback position.
//!
//! The session keeps one accumulator, the logical position, and only updates it at
//! transport boundaries. Everything that needs "where are we now" goes through
//! [`current_position`], so the ticker and synchronous queries can never disagree.

use crate::state::PlaybackState;

/// Position in seconds as seen at device time `now`.
pub fn current_position(
    state: PlaybackState,
    logical_position: f64,
    clock_at_start: f64,
    now: f64,
    duration: f64,
) -> f64 {
    match state {
        PlaybackState::Playing => accumulate(logical_position, clock_at_start, now).min(duration),
        PlaybackState::Paused | PlaybackState::Stopped => logical_position,
    }
}

/// Logical position after a playing interval that began at `clock_at_start`.
pub fn accumulate(logical_position: f64, clock_at_start: f64, now: f64) -> f64 {
    logical_position + (now - clock_at_start).max(0.0)
}

/// Buffer offset to start a voice from. Wraps a position sitting at (or past) the end back to 0.
pub fn start_offset(logical_position: f64, duration: f64) -> f64 {
    if duration <= 0.0 {
        return 0.0;
    }
    logical_position.rem_euclid(duration)
}

pub fn clamp_seek(target: f64, duration: f64) -> f64 {
    if target.is_nan() {
        return 0.0;
    }
    target.clamp(0.0, duration.max(0.0))
}

/// `m:ss`, as shown next to the progress bar.
pub fn format_time(seconds: f64) -> String {
    if seconds.is_nan() || seconds < 0.0 {
        return "0:00".to_string();
    }
    let minutes = (seconds / 60.0).floor() as u64;
    let secs = (seconds % 60.0).floor() as u64;
    format!("{}:{:02}", minutes, secs)
}
