use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{RATE_MAX, RATE_MIN, RATE_STEP};

/// Authoritative playback tuple for a room.
///
/// `position` is only meaningful together with `anchor`: while playing, the
/// logical position is `position + rate * (now - anchor)`. All mutations go
/// through [`crate::clock::consolidate`] first so that `position` never
/// silently diverges from real time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    /// Seconds into the current item, as of `anchor`.
    pub position: f64,
    /// Playback rate on the 0.25 grid, 0.25 ..= 3.0.
    pub rate: f64,
    /// Wall-clock instant at which `position` was last reconciled.
    pub anchor: DateTime<Utc>,
    pub audio_track: i32,
    /// -1 means subtitles off.
    pub subtitle_track: i32,
}

impl PlaybackState {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            is_playing: false,
            position: 0.0,
            rate: 1.0,
            anchor: now,
            audio_track: 0,
            subtitle_track: -1,
        }
    }
}

/// Check a requested rate against the accepted grid.
#[must_use]
pub fn is_valid_rate(rate: f64) -> bool {
    if !rate.is_finite() || !(RATE_MIN..=RATE_MAX).contains(&rate) {
        return false;
    }
    let steps = rate / RATE_STEP;
    (steps - steps.round()).abs() < 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_grid_boundaries() {
        assert!(is_valid_rate(0.25));
        assert!(is_valid_rate(3.0));
        assert!(is_valid_rate(1.0));
        assert!(is_valid_rate(1.75));
        assert!(!is_valid_rate(0.24));
        assert!(!is_valid_rate(3.25));
        assert!(!is_valid_rate(0.0));
        assert!(!is_valid_rate(1.1));
        assert!(!is_valid_rate(f64::NAN));
        assert!(!is_valid_rate(f64::INFINITY));
    }

    #[test]
    fn fresh_state_is_paused_at_zero() {
        let state = PlaybackState::new(Utc::now());
        assert!(!state.is_playing);
        assert_eq!(state.position, 0.0);
        assert_eq!(state.rate, 1.0);
        assert_eq!(state.audio_track, 0);
        assert_eq!(state.subtitle_track, -1);
    }
}
