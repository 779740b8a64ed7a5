//! Wall-clock anchored time extrapolation.
//!
//! Every mutation of a room's playback tuple funnels through these two
//! primitives. `consolidate` folds elapsed real time into the stored
//! position and re-anchors; `extrapolate` answers "where is the room now"
//! without mutating anything.

use chrono::{DateTime, Utc};

use crate::models::playback::PlaybackState;

/// Fold elapsed wall-clock time into `state.position` and re-anchor at `now`.
///
/// The `max(0, dt)` guards against backward wall-clock jumps: a clock that
/// stepped backwards must not rewind the room.
pub fn consolidate(state: &mut PlaybackState, now: DateTime<Utc>) {
    if state.is_playing {
        let dt = elapsed_seconds(state.anchor, now).max(0.0);
        state.position += state.rate * dt;
    }
    state.anchor = now;
}

/// Logical position at `now` without mutating the state.
#[must_use]
pub fn extrapolate(state: &PlaybackState, now: DateTime<Utc>) -> f64 {
    if state.is_playing {
        let dt = elapsed_seconds(state.anchor, now).max(0.0);
        state.position + state.rate * dt
    } else {
        state.position
    }
}

fn elapsed_seconds(anchor: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - anchor).num_milliseconds() as f64 / 1000.0
}

/// Interval of the background consolidation ticker.
pub const TICK_INTERVAL_SECS: u64 = 5;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn playing_state(position: f64, rate: f64, anchor: DateTime<Utc>) -> PlaybackState {
        PlaybackState {
            is_playing: true,
            position,
            rate,
            anchor,
            audio_track: 0,
            subtitle_track: -1,
        }
    }

    #[test]
    fn extrapolate_advances_with_rate() {
        let t0 = Utc::now();
        let state = playing_state(30.0, 2.0, t0);
        let pos = extrapolate(&state, t0 + Duration::seconds(4));
        assert!((pos - 38.0).abs() < 1e-6);
    }

    #[test]
    fn extrapolate_frozen_while_paused() {
        let t0 = Utc::now();
        let mut state = playing_state(30.0, 2.0, t0);
        state.is_playing = false;
        let pos = extrapolate(&state, t0 + Duration::seconds(60));
        assert!((pos - 30.0).abs() < 1e-9);
    }

    #[test]
    fn consolidate_folds_elapsed_time() {
        let t0 = Utc::now();
        let mut state = playing_state(10.0, 1.0, t0);
        let t1 = t0 + Duration::seconds(2);
        consolidate(&mut state, t1);
        assert!((state.position - 12.0).abs() < 1e-6);
        assert_eq!(state.anchor, t1);
    }

    #[test]
    fn consolidate_is_idempotent_within_one_tick() {
        let t0 = Utc::now();
        let mut state = playing_state(10.0, 1.5, t0);
        let t1 = t0 + Duration::seconds(3);
        consolidate(&mut state, t1);
        let after_first = state.position;
        consolidate(&mut state, t1);
        assert!((state.position - after_first).abs() < 1e-9);
    }

    #[test]
    fn backward_clock_jump_does_not_rewind() {
        let t0 = Utc::now();
        let mut state = playing_state(20.0, 1.0, t0);
        let earlier = t0 - Duration::seconds(30);
        consolidate(&mut state, earlier);
        assert!((state.position - 20.0).abs() < 1e-9);
        assert_eq!(state.anchor, earlier);

        assert!((extrapolate(&playing_state(20.0, 1.0, t0), earlier) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn rate_change_sequence_matches_piecewise_sum() {
        // position=30, rate=1 at t0; rate becomes 2 at t0+4; at t0+6 the
        // logical position is 30 + 1*4 + 2*2 = 38.
        let t0 = Utc::now();
        let mut state = playing_state(30.0, 1.0, t0);

        let t_change = t0 + Duration::seconds(4);
        consolidate(&mut state, t_change);
        state.rate = 2.0;

        let pos = extrapolate(&state, t0 + Duration::seconds(6));
        assert!((pos - 38.0).abs() < 1e-6);
    }

    #[test]
    fn time_monotonicity_while_playing() {
        let t0 = Utc::now();
        let state = playing_state(5.0, 0.25, t0);
        let mut last = f64::MIN;
        for secs in 0..20 {
            let pos = extrapolate(&state, t0 + Duration::seconds(secs));
            assert!(pos >= last);
            last = pos;
        }
    }
}
