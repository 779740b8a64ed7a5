use serde::{Deserialize, Serialize};

/// Sidecar (extracted) tracks are numbered from here so they can never
/// collide with container-internal stream indices.
pub const EXTERNAL_TRACK_BASE: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
}

impl MediaKind {
    /// Classify a filename by extension. Unknown extensions are treated as
    /// video, matching how the player handles them.
    #[must_use]
    pub fn from_filename(name: &str) -> Self {
        let ext = name
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "mp3" | "flac" | "ogg" | "wav" | "m4a" | "aac" | "opus" => Self::Audio,
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" => Self::Image,
            _ => Self::Video,
        }
    }
}

/// A single audio or subtitle stream attached to a local item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub index: i32,
    pub codec: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "default")]
    pub is_default: bool,
    #[serde(default)]
    pub is_external: bool,
    /// Serving URL for sidecar tracks; container streams have none.
    #[serde(default)]
    pub url: Option<String>,
}

impl Track {
    #[must_use]
    pub fn is_sidecar(&self) -> bool {
        self.index >= EXTERNAL_TRACK_BASE
    }
}

/// Audio + subtitle track lists for one item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackSet {
    #[serde(default)]
    pub audio: Vec<Track>,
    #[serde(default)]
    pub subtitles: Vec<Track>,
}

/// Third-party platforms an external embed can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExternalPlatform {
    Youtube,
    Vimeo,
    Dailymotion,
    Twitch,
    Soundcloud,
    Streamable,
    Gdrive,
    Kick,
    Rumble,
    DirectUrl,
}

/// Bound on which controls are meaningful for an external embed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncLevel {
    /// Play/pause/seek/rate all propagate.
    #[default]
    Full,
    /// Play/pause only.
    Limited,
    /// No per-frame control at all.
    Autoplay,
}

/// One entry of a room's playlist.
///
/// Unknown wire fields are ignored on deserialization, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaylistItem {
    #[serde(rename_all = "camelCase")]
    LocalMedia {
        filename: String,
        kind: MediaKind,
        #[serde(default)]
        tracks: TrackSet,
        #[serde(default)]
        selected_audio_track: i32,
        #[serde(default = "default_subtitle_off")]
        selected_subtitle_track: i32,
    },
    #[serde(rename_all = "camelCase")]
    ExternalEmbed {
        platform: ExternalPlatform,
        #[serde(default)]
        external_id: Option<String>,
        #[serde(default)]
        external_url: Option<String>,
        title: String,
        #[serde(default)]
        thumbnail: Option<String>,
        #[serde(default)]
        sync_level: SyncLevel,
    },
}

const fn default_subtitle_off() -> i32 {
    -1
}

impl PlaylistItem {
    #[must_use]
    pub fn local(filename: String) -> Self {
        let kind = MediaKind::from_filename(&filename);
        Self::LocalMedia {
            filename,
            kind,
            tracks: TrackSet::default(),
            selected_audio_track: 0,
            selected_subtitle_track: -1,
        }
    }

    /// Display title: filename for local items, embed title otherwise.
    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::LocalMedia { filename, .. } => filename,
            Self::ExternalEmbed { title, .. } => title,
        }
    }

    /// Local filename, if this is a local item.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::LocalMedia { filename, .. } => Some(filename),
            Self::ExternalEmbed { .. } => None,
        }
    }

    /// Reset track selections to the item's defaults (first/default audio
    /// stream, subtitles off unless a default subtitle stream exists).
    pub fn reset_track_selections(&mut self) {
        if let Self::LocalMedia {
            tracks,
            selected_audio_track,
            selected_subtitle_track,
            ..
        } = self
        {
            *selected_audio_track = tracks
                .audio
                .iter()
                .find(|t| t.is_default)
                .or_else(|| tracks.audio.first())
                .map_or(0, |t| t.index);
            *selected_subtitle_track = tracks
                .subtitles
                .iter()
                .find(|t| t.is_default)
                .map_or(-1, |t| t.index);
        }
    }

    /// Current selections as a `(audio, subtitle)` pair.
    #[must_use]
    pub fn selections(&self) -> (i32, i32) {
        match self {
            Self::LocalMedia {
                selected_audio_track,
                selected_subtitle_track,
                ..
            } => (*selected_audio_track, *selected_subtitle_track),
            Self::ExternalEmbed { .. } => (0, -1),
        }
    }
}

/// Ordered playlist plus the pointers into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub items: Vec<PlaylistItem>,
    /// -1 means idle (nothing selected).
    pub current_index: i32,
    /// Preload hint: the item viewers should fetch first.
    pub main_item_index: i32,
    /// Seconds into the main item at which playback starts.
    pub main_item_start_time: f64,
}

impl Default for Playlist {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            current_index: -1,
            main_item_index: -1,
            main_item_start_time: 0.0,
        }
    }
}

impl Playlist {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn in_range(&self, index: i32) -> bool {
        index >= 0 && (index as usize) < self.items.len()
    }

    #[must_use]
    pub fn current_item(&self) -> Option<&PlaylistItem> {
        if self.in_range(self.current_index) {
            self.items.get(self.current_index as usize)
        } else {
            None
        }
    }

    pub fn current_item_mut(&mut self) -> Option<&mut PlaylistItem> {
        if self.in_range(self.current_index) {
            self.items.get_mut(self.current_index as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_from_extension() {
        assert_eq!(MediaKind::from_filename("a.mkv"), MediaKind::Video);
        assert_eq!(MediaKind::from_filename("a.mp3"), MediaKind::Audio);
        assert_eq!(MediaKind::from_filename("a.PNG"), MediaKind::Image);
        assert_eq!(MediaKind::from_filename("noext"), MediaKind::Video);
    }

    #[test]
    fn reset_track_selections_prefers_defaults() {
        let mut item = PlaylistItem::local("movie.mkv".to_string());
        if let PlaylistItem::LocalMedia { tracks, .. } = &mut item {
            tracks.audio = vec![
                Track {
                    index: 0,
                    codec: "aac".into(),
                    language: Some("eng".into()),
                    title: None,
                    is_default: false,
                    is_external: false,
                    url: None,
                },
                Track {
                    index: 1,
                    codec: "ac3".into(),
                    language: Some("jpn".into()),
                    title: None,
                    is_default: true,
                    is_external: false,
                    url: None,
                },
            ];
            tracks.subtitles = vec![Track {
                index: 2,
                codec: "subrip".into(),
                language: Some("eng".into()),
                title: None,
                is_default: false,
                is_external: false,
                url: None,
            }];
        }
        item.reset_track_selections();
        assert_eq!(item.selections(), (1, -1));
    }

    #[test]
    fn unknown_wire_fields_are_ignored() {
        let raw = r#"{
            "type": "localMedia",
            "filename": "a.mkv",
            "kind": "video",
            "isYouTube": false,
            "legacyFlag": 42
        }"#;
        let item: PlaylistItem = serde_json::from_str(raw).expect("parse");
        assert_eq!(item.filename(), Some("a.mkv"));
    }

    #[test]
    fn external_embed_round_trips() {
        let item = PlaylistItem::ExternalEmbed {
            platform: ExternalPlatform::Youtube,
            external_id: Some("dQw4w9WgXcQ".into()),
            external_url: None,
            title: "Video".into(),
            thumbnail: None,
            sync_level: SyncLevel::Limited,
        };
        let json = serde_json::to_string(&item).expect("serialize");
        assert!(json.contains("\"syncLevel\":\"limited\""));
        let back: PlaylistItem = serde_json::from_str(&json).expect("parse");
        assert_eq!(back.title(), "Video");
    }

    #[test]
    fn sidecar_indices_are_distinguishable() {
        let t = Track {
            index: EXTERNAL_TRACK_BASE + 1,
            codec: "webvtt".into(),
            language: Some("eng".into()),
            title: None,
            is_default: false,
            is_external: true,
            url: Some("/tracks/a.vtt".into()),
        };
        assert!(t.is_sidecar());
    }

    #[test]
    fn playlist_range_checks() {
        let mut pl = Playlist::default();
        assert!(!pl.in_range(0));
        pl.items.push(PlaylistItem::local("a.mkv".into()));
        assert!(pl.in_range(0));
        assert!(!pl.in_range(1));
        assert!(!pl.in_range(-1));
    }
}
