pub mod bsl;
pub mod id;
pub mod playback;
pub mod playlist;
pub mod room;

pub use bsl::{BslClientState, BslIndex, ClientFile, DriftTable, DRIFT_MAX, DRIFT_MIN};
pub use id::{ConnectionId, Fingerprint, RoomCode};
pub use playback::PlaybackState;
pub use playlist::{
    ExternalPlatform, MediaKind, Playlist, PlaylistItem, SyncLevel, Track, TrackSet,
    EXTERNAL_TRACK_BASE,
};
pub use room::{Room, RoomSummary, ViewerInfo};
