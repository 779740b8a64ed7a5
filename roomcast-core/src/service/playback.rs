//! Authoritative playback state machine. Every operation here runs under
//! the owning room's write lock; callers fan out the resulting events while
//! still holding it so viewers never observe an intermediate state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::clock;
use crate::models::playback::is_valid_rate;
use crate::models::{PlaylistItem, Room};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Subtitle,
}

impl TrackKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "audio" => Ok(Self::Audio),
            "subtitle" | "subtitles" => Ok(Self::Subtitle),
            other => Err(Error::Validation(format!("Unknown track kind: {other}"))),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
        }
    }
}

/// Direction of a relative skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDirection {
    Forward,
    Backward,
}

impl SkipDirection {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "forward" => Ok(Self::Forward),
            "backward" => Ok(Self::Backward),
            other => Err(Error::Validation(format!("Unknown skip direction: {other}"))),
        }
    }

    fn sign(self) -> f64 {
        match self {
            Self::Forward => 1.0,
            Self::Backward => -1.0,
        }
    }
}

/// Playback state machine operating on rooms.
#[derive(Debug, Clone)]
pub struct PlaybackService {
    autoplay: bool,
    skip_intro_seconds: u32,
}

impl PlaybackService {
    #[must_use]
    pub const fn new(autoplay: bool, skip_intro_seconds: u32) -> Self {
        Self {
            autoplay,
            skip_intro_seconds,
        }
    }

    /// Parse raw wire items, silently dropping invalid shapes.
    #[must_use]
    pub fn parse_items(&self, raw_items: Vec<Value>) -> Vec<PlaylistItem> {
        raw_items
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<PlaylistItem>(value) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(error = %e, "Dropping playlist item with invalid shape");
                    None
                }
            })
            .collect()
    }

    /// Replace the playlist. An empty playlist is allowed and means idle.
    pub fn set_playlist(
        &self,
        room: &mut Room,
        mut items: Vec<PlaylistItem>,
        main_index: i32,
        start_time: f64,
        now: DateTime<Utc>,
    ) {
        for item in &mut items {
            item.reset_track_selections();
        }

        let len = items.len() as i32;
        room.playlist.items = items;
        room.playlist.current_index = if len > 0 { 0 } else { -1 };
        room.playlist.main_item_index = if main_index >= 0 && main_index < len {
            main_index
        } else {
            -1
        };
        room.playlist.main_item_start_time = start_time.max(0.0);

        room.playback.position = start_time.max(0.0);
        room.playback.anchor = now;
        room.playback.is_playing = self.autoplay && len > 0;

        let (audio, subtitle) = room
            .playlist
            .current_item()
            .map_or((0, -1), PlaylistItem::selections);
        room.playback.audio_track = audio;
        room.playback.subtitle_track = subtitle;
    }

    /// Jump to a playlist index. Out-of-range indices are ignored; returns
    /// whether anything changed.
    pub fn jump(&self, room: &mut Room, index: i32, now: DateTime<Utc>) -> bool {
        if !room.playlist.in_range(index) {
            return false;
        }
        clock::consolidate(&mut room.playback, now);
        room.playlist.current_index = index;
        room.playback.position = 0.0;
        room.playback.anchor = now;

        if let Some(item) = room.playlist.current_item_mut() {
            item.reset_track_selections();
        }
        let (audio, subtitle) = room
            .playlist
            .current_item()
            .map_or((0, -1), PlaylistItem::selections);
        room.playback.audio_track = audio;
        room.playback.subtitle_track = subtitle;
        true
    }

    /// Advance to the next item, wrapping at the end. No-op on an empty
    /// playlist.
    pub fn skip_to_next(&self, room: &mut Room, now: DateTime<Utc>) -> bool {
        let len = room.playlist.len() as i32;
        if len == 0 {
            return false;
        }
        let next = (room.playlist.current_index + 1).rem_euclid(len);
        self.jump(room, next, now)
    }

    pub fn set_playing(&self, room: &mut Room, playing: bool, now: DateTime<Utc>) {
        clock::consolidate(&mut room.playback, now);
        room.playback.is_playing = playing;
    }

    /// Absolute seek. Negative or non-finite targets are rejected and leave
    /// the state untouched.
    pub fn seek(&self, room: &mut Room, position: f64, now: DateTime<Utc>) -> Result<()> {
        if !position.is_finite() || position < 0.0 {
            return Err(Error::Validation(format!("Invalid seek target: {position}")));
        }
        room.playback.position = position;
        room.playback.anchor = now;
        Ok(())
    }

    pub fn skip_relative(
        &self,
        room: &mut Room,
        direction: SkipDirection,
        seconds: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(Error::Validation(format!("Invalid skip amount: {seconds}")));
        }
        clock::consolidate(&mut room.playback, now);
        room.playback.position = (room.playback.position + direction.sign() * seconds).max(0.0);
        Ok(())
    }

    /// Convenience wrapper: skip forward over a cold open.
    pub fn skip_intro(&self, room: &mut Room, now: DateTime<Utc>) -> Result<()> {
        self.skip_relative(
            room,
            SkipDirection::Forward,
            f64::from(self.skip_intro_seconds),
            now,
        )
    }

    pub fn set_rate(&self, room: &mut Room, rate: f64, now: DateTime<Utc>) -> Result<()> {
        if !is_valid_rate(rate) {
            return Err(Error::Validation(format!("Rate off the 0.25 grid: {rate}")));
        }
        clock::consolidate(&mut room.playback, now);
        room.playback.rate = rate;
        Ok(())
    }

    /// Select a track for the current item, updating both the live playback
    /// tuple and the item so the choice survives playlist cycling.
    pub fn select_track(&self, room: &mut Room, kind: TrackKind, index: i32) -> Result<()> {
        match kind {
            TrackKind::Audio if index < 0 => {
                return Err(Error::Validation("Audio track index must be >= 0".into()))
            }
            TrackKind::Subtitle if index < -1 => {
                return Err(Error::Validation("Subtitle track index must be >= -1".into()))
            }
            _ => {}
        }

        match kind {
            TrackKind::Audio => room.playback.audio_track = index,
            TrackKind::Subtitle => room.playback.subtitle_track = index,
        }

        if let Some(PlaylistItem::LocalMedia {
            selected_audio_track,
            selected_subtitle_track,
            ..
        }) = room.playlist.current_item_mut()
        {
            match kind {
                TrackKind::Audio => *selected_audio_track = index,
                TrackKind::Subtitle => *selected_subtitle_track = index,
            }
        }
        Ok(())
    }

    /// Swap two playlist entries, fixing up the pointers that referenced
    /// them.
    pub fn reorder(&self, room: &mut Room, from: i32, to: i32) -> Result<()> {
        if !room.playlist.in_range(from) || !room.playlist.in_range(to) {
            return Err(Error::Validation(format!(
                "Reorder indices out of range: {from} -> {to}"
            )));
        }
        room.playlist.items.swap(from as usize, to as usize);

        for pointer in [
            &mut room.playlist.current_index,
            &mut room.playlist.main_item_index,
        ] {
            if *pointer == from {
                *pointer = to;
            } else if *pointer == to {
                *pointer = from;
            }
        }
        Ok(())
    }

    /// Full-state push from a trusted client (`control` with no action).
    pub fn apply_state_push(
        &self,
        room: &mut Room,
        is_playing: bool,
        position: f64,
        rate: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !position.is_finite() || position < 0.0 {
            return Err(Error::Validation(format!("Invalid position: {position}")));
        }
        if !is_valid_rate(rate) {
            return Err(Error::Validation(format!("Rate off the 0.25 grid: {rate}")));
        }
        room.playback.is_playing = is_playing;
        room.playback.position = position;
        room.playback.rate = rate;
        room.playback.anchor = now;
        Ok(())
    }
}
