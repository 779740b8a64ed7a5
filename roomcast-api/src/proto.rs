//! Wire protocol: JSON events in a `{"event": name, "data": payload}`
//! envelope, bidirectional over the WebSocket. Event names are stable wire
//! contract; unknown fields inside payloads are ignored, never stored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use roomcast_core::models::{ClientFile, Playlist, RoomCode, RoomSummary};
use roomcast_core::service::bsl::{BslStatus, MatchResult};

/// Events the server emits. Room-scoped unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Sync {
        is_playing: bool,
        position: f64,
        /// Wall-clock anchor as epoch milliseconds.
        anchor: i64,
        rate: f64,
        audio_track: i32,
        subtitle_track: i32,
    },
    #[serde(rename_all = "camelCase")]
    PlaylistUpdate { playlist: Playlist },
    #[serde(rename_all = "camelCase")]
    PlaylistPosition { current_index: i32 },
    #[serde(rename_all = "camelCase")]
    TrackChange {
        video_index: i32,
        #[serde(rename = "type")]
        kind: String,
        track_index: i32,
    },
    ViewerCount(usize),
    /// Legacy single-room mode counterpart of `viewer-count`.
    ClientCount(usize),
    /// Process-wide: public rooms list changed.
    RoomsUpdated(Vec<RoomSummary>),
    #[serde(rename_all = "camelCase")]
    RoomDeleted { room_code: RoomCode },
    #[serde(rename_all = "camelCase")]
    RateLimitError { message: String, retry_after: u64 },
    #[serde(rename_all = "camelCase")]
    AdminAuthResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AdminError { event: String, message: String },
    BslStatusUpdate(BslStatus),
    BslMatchResult(MatchResult),
    #[serde(rename_all = "camelCase")]
    BslDriftUpdate { drift_values: HashMap<i32, i32> },
    /// Prompt a viewer to (re)select their local folder.
    BslFolderRequest,
    #[serde(rename_all = "camelCase")]
    ChatMessage { sender: String, message: String },
    #[serde(rename_all = "camelCase")]
    NameUpdated { name: String },
    #[serde(rename_all = "camelCase")]
    CreateRoomResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_code: Option<RoomCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoomResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_name: Option<String>,
        is_admin: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        viewers: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PlaylistSet {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Snapshot answering `request-initial-state`.
    #[serde(rename_all = "camelCase")]
    InitialState {
        room_name: String,
        playlist: Playlist,
        is_playing: bool,
        position: f64,
        anchor: i64,
        rate: f64,
        audio_track: i32,
        subtitle_track: i32,
        viewer_count: usize,
        chat_enabled: bool,
        controls_disabled: bool,
    },
    ClientList(Vec<ClientEntry>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub display_name: String,
}

/// Free-form `control` payload; which fields matter depends on `action`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlPayload {
    pub action: Option<String>,
    /// playpause: target state.
    pub state: Option<bool>,
    /// skip: "forward" / "backward".
    pub direction: Option<String>,
    pub seconds: Option<f64>,
    /// seek target.
    pub time: Option<f64>,
    /// selectTrack: "audio" / "subtitle".
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub index: Option<i32>,
    pub rate: Option<f64>,
    /// Direct sync tuple (action-less push).
    pub is_playing: Option<bool>,
    pub position: Option<f64>,
}

/// Events clients send.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        name: String,
        #[serde(default)]
        is_private: bool,
        fingerprint: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_code: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        fingerprint: Option<String>,
    },
    LeaveRoom,
    #[serde(rename_all = "camelCase")]
    DeleteRoom {
        room_code: String,
        fingerprint: String,
    },
    GetRooms,
    RequestInitialState,
    RequestSync,
    Control(ControlPayload),
    #[serde(rename_all = "camelCase")]
    SetPlaylist {
        playlist: Vec<serde_json::Value>,
        #[serde(default)]
        main_video_index: Option<i32>,
        #[serde(default)]
        start_time: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    PlaylistJump { index: i32 },
    /// Wire alias kept for old clients; routed to the jump handler.
    #[serde(rename_all = "camelCase")]
    PlaylistNext { index: i32 },
    #[serde(rename_all = "camelCase")]
    PlaylistReorder { from_index: i32, to_index: i32 },
    SkipToNextVideo,
    #[serde(rename_all = "camelCase")]
    TrackChange {
        video_index: i32,
        #[serde(rename = "type")]
        kind: String,
        track_index: i32,
    },
    #[serde(rename_all = "camelCase")]
    BslAdminRegister {
        fingerprint: String,
        #[serde(default)]
        room_code: Option<String>,
    },
    BslCheckRequest,
    BslGetStatus,
    #[serde(rename_all = "camelCase")]
    BslFolderSelected {
        fingerprint: String,
        #[serde(default)]
        display_name: Option<String>,
        files: Vec<ClientFile>,
    },
    #[serde(rename_all = "camelCase")]
    BslManualMatch {
        client_connection_id: String,
        client_file_name: String,
        playlist_index: i32,
    },
    #[serde(rename_all = "camelCase")]
    BslSetDrift {
        client_fingerprint: String,
        playlist_index: i32,
        drift_seconds: i32,
    },
    #[serde(rename_all = "camelCase")]
    ClientRegister { fingerprint: String },
    GetClientList,
    #[serde(rename_all = "camelCase")]
    SetClientName {
        client_id: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    SetClientDisplayName {
        fingerprint: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage { sender: String, message: String },
}

impl ClientEvent {
    /// Wire name, for logs and the admin-only whitelist.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "create-room",
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom => "leave-room",
            Self::DeleteRoom { .. } => "delete-room",
            Self::GetRooms => "get-rooms",
            Self::RequestInitialState => "request-initial-state",
            Self::RequestSync => "request-sync",
            Self::Control(_) => "control",
            Self::SetPlaylist { .. } => "set-playlist",
            Self::PlaylistJump { .. } => "playlist-jump",
            Self::PlaylistNext { .. } => "playlist-next",
            Self::PlaylistReorder { .. } => "playlist-reorder",
            Self::SkipToNextVideo => "skip-to-next-video",
            Self::TrackChange { .. } => "track-change",
            Self::BslAdminRegister { .. } => "bsl-admin-register",
            Self::BslCheckRequest => "bsl-check-request",
            Self::BslGetStatus => "bsl-get-status",
            Self::BslFolderSelected { .. } => "bsl-folder-selected",
            Self::BslManualMatch { .. } => "bsl-manual-match",
            Self::BslSetDrift { .. } => "bsl-set-drift",
            Self::ClientRegister { .. } => "client-register",
            Self::GetClientList => "get-client-list",
            Self::SetClientName { .. } => "set-client-name",
            Self::SetClientDisplayName { .. } => "set-client-display-name",
            Self::ChatMessage { .. } => "chat-message",
        }
    }

    /// Whether this event requires the connection to be the room's admin.
    /// `create-room` and `bsl-admin-register` establish admin status and
    /// stay open.
    #[must_use]
    pub fn admin_only(&self) -> bool {
        matches!(
            self,
            Self::SetPlaylist { .. }
                | Self::PlaylistReorder { .. }
                | Self::PlaylistJump { .. }
                | Self::PlaylistNext { .. }
                | Self::TrackChange { .. }
                | Self::SkipToNextVideo
                | Self::BslCheckRequest
                | Self::BslGetStatus
                | Self::BslManualMatch { .. }
                | Self::BslSetDrift { .. }
                | Self::SetClientName { .. }
                | Self::SetClientDisplayName { .. }
                | Self::GetClientList
                | Self::DeleteRoom { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_parse_from_wire_names() {
        let raw = r#"{"event":"create-room","data":{"name":"Movie night","isPrivate":true,"fingerprint":"fp1"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).expect("parse");
        assert_eq!(event.name(), "create-room");

        let raw = r#"{"event":"request-sync"}"#;
        let event: ClientEvent = serde_json::from_str(raw).expect("parse unit");
        assert_eq!(event.name(), "request-sync");

        let raw = r#"{"event":"control","data":{"action":"seek","time":42.5}}"#;
        match serde_json::from_str::<ClientEvent>(raw).expect("parse control") {
            ClientEvent::Control(payload) => {
                assert_eq!(payload.action.as_deref(), Some("seek"));
                assert_eq!(payload.time, Some(42.5));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn server_events_serialize_with_kebab_names() {
        let event = ServerEvent::Sync {
            is_playing: true,
            position: 12.0,
            anchor: 1_700_000_000_000,
            rate: 1.0,
            audio_track: 0,
            subtitle_track: -1,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "sync");
        assert_eq!(json["data"]["isPlaying"], true);
        assert_eq!(json["data"]["subtitleTrack"], -1);

        let event = ServerEvent::RoomDeleted {
            room_code: RoomCode::normalize("ABC234"),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "room-deleted");
        assert_eq!(json["data"]["roomCode"], "ABC234");
    }

    #[test]
    fn viewer_count_payload_is_bare_integer() {
        let json = serde_json::to_value(ServerEvent::ViewerCount(4)).expect("serialize");
        assert_eq!(json["event"], "viewer-count");
        assert_eq!(json["data"], 4);
    }

    #[test]
    fn admin_whitelist_covers_control_surface() {
        let admin_only = [
            r#"{"event":"set-playlist","data":{"playlist":[]}}"#,
            r#"{"event":"playlist-reorder","data":{"fromIndex":0,"toIndex":1}}"#,
            r#"{"event":"playlist-jump","data":{"index":0}}"#,
            r#"{"event":"track-change","data":{"videoIndex":0,"type":"audio","trackIndex":1}}"#,
            r#"{"event":"skip-to-next-video"}"#,
            r#"{"event":"bsl-check-request"}"#,
            r#"{"event":"bsl-get-status"}"#,
            r#"{"event":"bsl-manual-match","data":{"clientConnectionId":"c","clientFileName":"f","playlistIndex":0}}"#,
            r#"{"event":"bsl-set-drift","data":{"clientFingerprint":"f","playlistIndex":0,"driftSeconds":3}}"#,
            r#"{"event":"set-client-name","data":{"clientId":"c","displayName":"n"}}"#,
            r#"{"event":"set-client-display-name","data":{"fingerprint":"f","displayName":"n"}}"#,
            r#"{"event":"get-client-list"}"#,
            r#"{"event":"delete-room","data":{"roomCode":"ABC234","fingerprint":"f"}}"#,
        ];
        for raw in admin_only {
            let event: ClientEvent = serde_json::from_str(raw).expect(raw);
            assert!(event.admin_only(), "{} should be admin-only", event.name());
        }

        for raw in [
            r#"{"event":"create-room","data":{"name":"x","fingerprint":"f"}}"#,
            r#"{"event":"bsl-admin-register","data":{"fingerprint":"f"}}"#,
            r#"{"event":"chat-message","data":{"sender":"a","message":"hi"}}"#,
        ] {
            let event: ClientEvent = serde_json::from_str(raw).expect(raw);
            assert!(!event.admin_only(), "{} should be open", event.name());
        }
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let raw = r#"{"event":"join-room","data":{"roomCode":"abc234","name":"V","fingerprint":"f","extraField":123}}"#;
        let event: ClientEvent = serde_json::from_str(raw).expect("parse");
        assert_eq!(event.name(), "join-room");
    }
}
