//! Inbound event pipeline: rate limit, validate, resolve the target room,
//! mutate under the room's write lock, then fan out while still holding it
//! so no viewer observes an intermediate state.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use roomcast_core::config::JoinMode;
use roomcast_core::models::{ConnectionId, Fingerprint, Room, RoomCode, ViewerInfo};
use roomcast_core::media::MediaLibrary;
use roomcast_core::service::bsl::ServerFileInfo;
use roomcast_core::service::{
    AdminAuthority, BslService, ChatOutcome, ChatService, PlaybackService, RateLimiter,
    RoomRegistry, SharedRoom, SkipDirection, TrackKind,
};
use roomcast_core::store::EventLog;
use roomcast_core::{Config, Error, Result};

use crate::hub::SessionHub;
use crate::proto::{ClientEntry, ClientEvent, ControlPayload, ServerEvent};
use crate::validation;

/// Fixed code of the implicit room used when rooms are disabled.
pub const LEGACY_ROOM_CODE: &str = "SHARED";

/// Delay before force-closing a connection that failed admin auth.
const AUTH_FAILURE_DISCONNECT: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    pub config: Arc<Config>,
    pub registry: Arc<RoomRegistry>,
    pub playback: PlaybackService,
    pub bsl: BslService,
    pub chat: ChatService,
    pub admin: Arc<AdminAuthority>,
    pub rate_limiter: Arc<RateLimiter>,
    pub media: Arc<dyn MediaLibrary>,
    pub event_log: Arc<EventLog>,
    pub hub: Arc<SessionHub>,
}

impl Dispatcher {
    /// Connection opened. In legacy (rooms-off) mode every connection joins
    /// the shared room immediately.
    pub async fn handle_connect(&self, conn: &ConnectionId) {
        if !self.config.server_mode {
            if let Some((code, room)) = self.registry.find(LEGACY_ROOM_CODE) {
                self.join_room_internal(conn, &code, &room, None, None).await;
                self.broadcast_presence(&code, &room);
            }
        }
    }

    /// Connection closed: drop every per-connection trace and tell the room.
    pub async fn handle_disconnect(&self, conn: &ConnectionId) {
        if let Some((code, room)) = self.current_room(conn) {
            {
                let mut guard = room.write();
                guard.viewers.remove(conn);
                guard.bsl.clients.remove(conn);
                if guard.admin_connection.as_ref() == Some(conn) {
                    guard.admin_connection = None;
                }
            }
            self.hub.leave_room(conn);
            self.broadcast_presence(&code, &room);
        }
        self.admin.unregister(conn);
        self.hub.unregister(conn);
    }

    /// The single inbound pipeline.
    pub async fn dispatch(&self, conn: &ConnectionId, event: ClientEvent) {
        // 1. Rate limit by remote address.
        if let Some(meta) = self.hub.meta(conn) {
            if let Err(Error::RateLimit {
                retry_after_seconds,
            }) = self.rate_limiter.check(meta.remote_addr)
            {
                self.hub.send_to(
                    conn,
                    &ServerEvent::RateLimitError {
                        message: "Too many events".to_string(),
                        retry_after: retry_after_seconds,
                    },
                );
                return;
            }
        }

        // 2. Authorize admin-only events against the room's admin binding.
        if event.admin_only() && !self.is_room_admin(conn) {
            warn!(connection = %conn, event = event.name(), "Rejected non-admin event");
            self.hub.send_to(
                conn,
                &ServerEvent::AdminError {
                    event: event.name().to_string(),
                    message: "Admin authority required".to_string(),
                },
            );
            return;
        }

        let name = event.name();
        if let Err(e) = self.route(conn, event).await {
            debug!(connection = %conn, event = name, error = %e, "Event rejected");
            self.hub.send_to(
                conn,
                &ServerEvent::AdminError {
                    event: name.to_string(),
                    message: e.to_string(),
                },
            );
        }
    }

    async fn route(&self, conn: &ConnectionId, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::CreateRoom {
                name,
                is_private,
                fingerprint,
            } => self.on_create_room(conn, name, is_private, fingerprint).await,
            ClientEvent::JoinRoom {
                room_code,
                name,
                fingerprint,
            } => self.on_join_room(conn, &room_code, name, fingerprint).await,
            ClientEvent::LeaveRoom => {
                self.on_leave_room(conn);
                Ok(())
            }
            ClientEvent::DeleteRoom {
                room_code,
                fingerprint,
            } => self.on_delete_room(conn, &room_code, &fingerprint).await,
            ClientEvent::GetRooms => {
                self.hub
                    .send_to(conn, &ServerEvent::RoomsUpdated(self.registry.list_public()));
                Ok(())
            }
            ClientEvent::RequestInitialState => self.on_request_initial_state(conn),
            ClientEvent::RequestSync => self.on_request_sync(conn),
            ClientEvent::Control(payload) => self.on_control(conn, payload).await,
            ClientEvent::SetPlaylist {
                playlist,
                main_video_index,
                start_time,
            } => {
                self.on_set_playlist(conn, playlist, main_video_index, start_time)
                    .await
            }
            ClientEvent::PlaylistJump { index } | ClientEvent::PlaylistNext { index } => {
                self.on_playlist_jump(conn, index).await
            }
            ClientEvent::PlaylistReorder {
                from_index,
                to_index,
            } => self.on_playlist_reorder(conn, from_index, to_index).await,
            ClientEvent::SkipToNextVideo => self.on_skip_to_next(conn).await,
            ClientEvent::TrackChange {
                video_index,
                kind,
                track_index,
            } => self.on_track_change(conn, video_index, &kind, track_index),
            ClientEvent::BslAdminRegister {
                fingerprint,
                room_code,
            } => self.on_bsl_admin_register(conn, fingerprint, room_code).await,
            ClientEvent::BslCheckRequest => self.on_bsl_check_request(conn),
            ClientEvent::BslGetStatus => self.on_bsl_get_status(conn),
            ClientEvent::BslFolderSelected {
                fingerprint,
                display_name,
                files,
            } => {
                self.on_bsl_folder_selected(conn, fingerprint, display_name, files)
                    .await
            }
            ClientEvent::BslManualMatch {
                client_connection_id,
                client_file_name,
                playlist_index,
            } => self.on_bsl_manual_match(conn, &client_connection_id, &client_file_name, playlist_index),
            ClientEvent::BslSetDrift {
                client_fingerprint,
                playlist_index,
                drift_seconds,
            } => self.on_bsl_set_drift(conn, &client_fingerprint, playlist_index, drift_seconds),
            ClientEvent::ClientRegister { fingerprint } => {
                self.on_client_register(conn, fingerprint);
                Ok(())
            }
            ClientEvent::GetClientList => self.on_get_client_list(conn),
            ClientEvent::SetClientName {
                client_id,
                display_name,
            } => self.on_set_client_name(conn, &client_id, &display_name),
            ClientEvent::SetClientDisplayName {
                fingerprint,
                display_name,
            } => self.on_set_client_display_name(conn, &fingerprint, &display_name),
            ClientEvent::ChatMessage { sender, message } => {
                self.on_chat_message(conn, &sender, &message).await
            }
        }
    }

    // ----- room lifecycle -------------------------------------------------

    async fn on_create_room(
        &self,
        conn: &ConnectionId,
        name: String,
        is_private: bool,
        fingerprint: String,
    ) -> Result<()> {
        if !self.config.server_mode {
            self.hub.send_to(
                conn,
                &ServerEvent::CreateRoomResult {
                    success: false,
                    room_code: None,
                    room_name: None,
                    error: Some("Rooms are disabled on this server".to_string()),
                },
            );
            return Ok(());
        }
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.len() > 64 {
            return Err(Error::Validation("Room name must be 1-64 characters".into()));
        }
        let fp = Fingerprint::from(fingerprint);
        if let Err(e) = self.admin.register(conn.clone(), fp.clone()) {
            self.reject_admin(conn, &e);
            return Ok(());
        }

        let (code, room) = self
            .registry
            .create_room(trimmed.to_string(), is_private, fp.clone())?;
        self.join_room_internal(conn, &code, &room, Some(fp), None).await;
        room.write().admin_connection = Some(conn.clone());

        self.hub.send_to(
            conn,
            &ServerEvent::AdminAuthResult {
                success: true,
                reason: None,
            },
        );
        self.hub.send_to(
            conn,
            &ServerEvent::CreateRoomResult {
                success: true,
                room_code: Some(code.clone()),
                room_name: Some(trimmed.to_string()),
                error: None,
            },
        );
        self.hub
            .broadcast_global(&ServerEvent::RoomsUpdated(self.registry.list_public()));
        self.event_log
            .append_room(&code, "room-created", json!({"name": trimmed}))
            .await;
        Ok(())
    }

    async fn on_join_room(
        &self,
        conn: &ConnectionId,
        raw_code: &str,
        name: Option<String>,
        fingerprint: Option<String>,
    ) -> Result<()> {
        let Some((code, room)) = self.registry.find(raw_code) else {
            self.hub.send_to(
                conn,
                &ServerEvent::JoinRoomResult {
                    success: false,
                    room_name: None,
                    is_admin: false,
                    viewers: None,
                    error: Some("Room not found".to_string()),
                },
            );
            return Ok(());
        };

        let fp = fingerprint.map(Fingerprint::from);
        let is_admin = fp
            .as_ref()
            .is_some_and(|fp| self.registry.is_admin_fingerprint(&code, fp));

        self.join_room_internal(conn, &code, &room, fp, name).await;

        let (room_name, viewer_names) = {
            let mut guard = room.write();
            if is_admin {
                guard.admin_connection = Some(conn.clone());
            }
            let names = guard
                .viewers
                .values()
                .map(|v| v.display_name.clone())
                .collect();
            (guard.name.clone(), names)
        };

        self.hub.send_to(
            conn,
            &ServerEvent::JoinRoomResult {
                success: true,
                room_name: Some(room_name),
                is_admin,
                viewers: Some(viewer_names),
                error: None,
            },
        );
        self.broadcast_presence(&code, &room);

        // JOIN_MODE=reset restarts everyone at zero instead of syncing the
        // newcomer forward.
        if self.config.join_mode == JoinMode::Reset {
            let now = Utc::now();
            {
                let mut guard = room.write();
                guard.playback.position = 0.0;
                guard.playback.anchor = now;
            }
            self.broadcast_sync(&code, &room);
        }

        self.event_log
            .append_room(&code, "viewer-joined", json!({"connection": conn.as_str()}))
            .await;
        Ok(())
    }

    fn on_leave_room(&self, conn: &ConnectionId) {
        if let Some((code, room)) = self.current_room(conn) {
            {
                let mut guard = room.write();
                guard.viewers.remove(conn);
                guard.bsl.clients.remove(conn);
                if guard.admin_connection.as_ref() == Some(conn) {
                    guard.admin_connection = None;
                }
            }
            self.hub.leave_room(conn);
            self.broadcast_presence(&code, &room);
        }
    }

    async fn on_delete_room(
        &self,
        conn: &ConnectionId,
        raw_code: &str,
        fingerprint: &str,
    ) -> Result<()> {
        let fp = Fingerprint::from(fingerprint);
        let code = RoomCode::normalize(raw_code);
        let members = self.registry.delete_room(raw_code, &fp)?;

        let event = ServerEvent::RoomDeleted {
            room_code: code.clone(),
        };
        self.hub.broadcast_room(&code, &event);
        // The initiator may not be a member (HTTP-side admin tools).
        if !members.contains(conn) {
            self.hub.send_to(conn, &event);
        }
        for member in members {
            self.hub.leave_room(&member);
        }
        self.event_log.delete_room_log(&code).await;
        self.hub
            .broadcast_global(&ServerEvent::RoomsUpdated(self.registry.list_public()));
        Ok(())
    }

    // ----- snapshots ------------------------------------------------------

    fn on_request_initial_state(&self, conn: &ConnectionId) -> Result<()> {
        let (_, room) = self.require_room(conn)?;
        let guard = room.read();
        self.hub.send_to(
            conn,
            &ServerEvent::InitialState {
                room_name: guard.name.clone(),
                playlist: guard.playlist.clone(),
                is_playing: guard.playback.is_playing,
                position: guard.playback.position,
                anchor: guard.playback.anchor.timestamp_millis(),
                rate: guard.playback.rate,
                audio_track: guard.playback.audio_track,
                subtitle_track: guard.playback.subtitle_track,
                viewer_count: guard.viewer_count(),
                chat_enabled: self.config.chat_enabled,
                controls_disabled: self.config.client_controls_disabled,
            },
        );
        Ok(())
    }

    fn on_request_sync(&self, conn: &ConnectionId) -> Result<()> {
        let (_, room) = self.require_room(conn)?;
        let event = {
            let guard = room.read();
            sync_event(&guard)
        };
        self.hub.send_to(conn, &event);
        Ok(())
    }

    // ----- playback control ----------------------------------------------

    async fn on_control(&self, conn: &ConnectionId, payload: ControlPayload) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        if self.config.client_controls_disabled && !self.is_room_admin(conn) {
            debug!(connection = %conn, "Client controls disabled, ignoring control");
            return Ok(());
        }

        let now = Utc::now();
        match payload.action.as_deref() {
            Some("playpause") => {
                let playing = payload
                    .state
                    .ok_or_else(|| Error::Validation("playpause requires state".into()))?;
                let mut guard = room.write();
                self.playback.set_playing(&mut guard, playing, now);
            }
            Some("skip") => {
                let direction = SkipDirection::parse(
                    payload.direction.as_deref().unwrap_or("forward"),
                )?;
                let seconds = payload
                    .seconds
                    .unwrap_or_else(|| f64::from(self.config.skip_seconds));
                let mut guard = room.write();
                self.playback
                    .skip_relative(&mut guard, direction, seconds, now)?;
            }
            Some("seek") => {
                let time = validation::validate_time(
                    payload
                        .time
                        .ok_or_else(|| Error::Validation("seek requires time".into()))?,
                )?;
                let mut guard = room.write();
                self.playback.seek(&mut guard, time, now)?;
            }
            Some("selectTrack") => {
                let kind = TrackKind::parse(
                    payload
                        .kind
                        .as_deref()
                        .ok_or_else(|| Error::Validation("selectTrack requires type".into()))?,
                )?;
                let index = payload
                    .index
                    .ok_or_else(|| Error::Validation("selectTrack requires index".into()))?;
                let video_index = {
                    let mut guard = room.write();
                    self.playback.select_track(&mut guard, kind, index)?;
                    guard.playlist.current_index
                };
                self.hub.broadcast_room(
                    &code,
                    &ServerEvent::TrackChange {
                        video_index,
                        kind: kind.as_str().to_string(),
                        track_index: index,
                    },
                );
                self.broadcast_sync(&code, &room);
                return Ok(());
            }
            Some("rate") => {
                let rate = payload
                    .rate
                    .ok_or_else(|| Error::Validation("rate requires rate".into()))?;
                let mut guard = room.write();
                self.playback.set_rate(&mut guard, rate, now)?;
            }
            Some("skipIntro") => {
                let mut guard = room.write();
                self.playback.skip_intro(&mut guard, now)?;
            }
            Some(other) => {
                return Err(Error::Validation(format!("Unknown control action: {other}")));
            }
            None => {
                // Action-less full state push; accepted only when client
                // sync is enabled.
                if self.config.client_sync_disabled {
                    debug!(connection = %conn, "Ignoring state push (CLIENT_SYNC_DISABLED)");
                    return Ok(());
                }
                let is_playing = payload
                    .is_playing
                    .ok_or_else(|| Error::Validation("State push requires isPlaying".into()))?;
                let position = payload
                    .position
                    .ok_or_else(|| Error::Validation("State push requires position".into()))?;
                let mut guard = room.write();
                let rate = payload.rate.unwrap_or(guard.playback.rate);
                self.playback
                    .apply_state_push(&mut guard, is_playing, position, rate, now)?;
            }
        }

        self.broadcast_sync(&code, &room);
        self.event_log
            .append_room(
                &code,
                "control",
                json!({"action": payload.action, "connection": conn.as_str()}),
            )
            .await;
        Ok(())
    }

    async fn on_set_playlist(
        &self,
        conn: &ConnectionId,
        raw_items: Vec<serde_json::Value>,
        main_video_index: Option<i32>,
        start_time: Option<f64>,
    ) -> Result<()> {
        let (code, room) = match self.require_room(conn) {
            Ok(found) => found,
            Err(e) => {
                self.hub.send_to(
                    conn,
                    &ServerEvent::PlaylistSet {
                        success: false,
                        error: Some(e.to_string()),
                    },
                );
                return Ok(());
            }
        };

        let mut items = self.playback.parse_items(raw_items);
        items.retain(|item| match item.filename() {
            Some(name) => validation::validate_filename(name).is_ok(),
            None => true,
        });

        // Probe tracks outside the room lock; failures degrade to empty
        // track lists.
        for item in &mut items {
            if let roomcast_core::models::PlaylistItem::LocalMedia {
                filename, tracks, ..
            } = item
            {
                if let Ok(found) = self.media.tracks_for(filename).await {
                    *tracks = found;
                }
            }
        }

        let start = start_time.unwrap_or(0.0).max(0.0);
        {
            let mut guard = room.write();
            self.playback.set_playlist(
                &mut guard,
                items,
                main_video_index.unwrap_or(0),
                start,
                Utc::now(),
            );
        }

        self.broadcast_playlist(&code, &room);
        self.broadcast_sync(&code, &room);
        self.hub.send_to(
            conn,
            &ServerEvent::PlaylistSet {
                success: true,
                error: None,
            },
        );
        self.event_log
            .append_room(&code, "set-playlist", json!({"items": room.read().playlist.len()}))
            .await;
        Ok(())
    }

    async fn on_playlist_jump(&self, conn: &ConnectionId, index: i32) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        let changed = {
            let mut guard = room.write();
            self.playback.jump(&mut guard, index, Utc::now())
        };
        if changed {
            self.broadcast_position(&code, &room);
            self.broadcast_sync(&code, &room);
            self.event_log
                .append_room(&code, "playlist-jump", json!({"index": index}))
                .await;
        }
        Ok(())
    }

    async fn on_skip_to_next(&self, conn: &ConnectionId) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        let changed = {
            let mut guard = room.write();
            self.playback.skip_to_next(&mut guard, Utc::now())
        };
        if changed {
            self.broadcast_position(&code, &room);
            self.broadcast_sync(&code, &room);
        }
        Ok(())
    }

    async fn on_playlist_reorder(&self, conn: &ConnectionId, from: i32, to: i32) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        {
            let mut guard = room.write();
            self.playback.reorder(&mut guard, from, to)?;
        }
        self.broadcast_playlist(&code, &room);
        self.event_log
            .append_room(&code, "playlist-reorder", json!({"from": from, "to": to}))
            .await;
        Ok(())
    }

    fn on_track_change(
        &self,
        conn: &ConnectionId,
        video_index: i32,
        kind: &str,
        track_index: i32,
    ) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        validation::validate_track_index(kind, track_index)?;
        let parsed = TrackKind::parse(kind)?;

        {
            let mut guard = room.write();
            validation::validate_playlist_index(video_index, guard.playlist.len())?;
            if guard.playlist.current_index == video_index {
                self.playback.select_track(&mut guard, parsed, track_index)?;
            } else if let Some(roomcast_core::models::PlaylistItem::LocalMedia {
                selected_audio_track,
                selected_subtitle_track,
                ..
            }) = guard.playlist.items.get_mut(video_index as usize)
            {
                match parsed {
                    TrackKind::Audio => *selected_audio_track = track_index,
                    TrackKind::Subtitle => *selected_subtitle_track = track_index,
                }
            }
        }

        self.hub.broadcast_room(
            &code,
            &ServerEvent::TrackChange {
                video_index,
                kind: parsed.as_str().to_string(),
                track_index,
            },
        );
        Ok(())
    }

    // ----- BSL ------------------------------------------------------------

    async fn on_bsl_admin_register(
        &self,
        conn: &ConnectionId,
        fingerprint: String,
        room_code: Option<String>,
    ) -> Result<()> {
        let fp = Fingerprint::from(fingerprint);
        if let Err(e) = self.admin.register(conn.clone(), fp.clone()) {
            self.reject_admin(conn, &e);
            return Ok(());
        }

        // Bind as the admin connection of the target room.
        let target = match room_code {
            Some(raw) => self.registry.find(&raw),
            None => self.current_room(conn),
        };
        if let Some((code, room)) = target {
            let bound = {
                let mut guard = room.write();
                match &guard.admin_fingerprint {
                    None => {
                        guard.admin_fingerprint = Some(fp.clone());
                        guard.admin_connection = Some(conn.clone());
                        true
                    }
                    Some(stored) if *stored == fp => {
                        guard.admin_connection = Some(conn.clone());
                        true
                    }
                    Some(_) => false,
                }
            };
            if !bound {
                self.reject_admin(
                    conn,
                    &Error::Auth("Room is bound to a different admin device".into()),
                );
                return Ok(());
            }
            if self.hub.room_of(conn).as_ref() != Some(&code) {
                self.join_room_internal(conn, &code, &room, Some(fp), None).await;
            } else {
                self.hub.set_fingerprint(conn, fp);
            }
        }

        self.hub.send_to(
            conn,
            &ServerEvent::AdminAuthResult {
                success: true,
                reason: None,
            },
        );
        Ok(())
    }

    fn on_bsl_check_request(&self, conn: &ConnectionId) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        let targets: Vec<ConnectionId> = {
            let guard = room.read();
            guard
                .viewers
                .keys()
                .filter(|member| {
                    *member != conn
                        && !guard
                            .bsl
                            .clients
                            .get(*member)
                            .is_some_and(|state| state.folder_selected)
                })
                .cloned()
                .collect()
        };
        for target in targets {
            self.hub.send_to(&target, &ServerEvent::BslFolderRequest);
        }
        self.send_bsl_status(conn, &code, &room);
        Ok(())
    }

    fn on_bsl_get_status(&self, conn: &ConnectionId) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        self.send_bsl_status(conn, &code, &room);
        Ok(())
    }

    async fn on_bsl_folder_selected(
        &self,
        conn: &ConnectionId,
        fingerprint: String,
        display_name: Option<String>,
        files: Vec<roomcast_core::models::ClientFile>,
    ) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        let fp = Fingerprint::from(fingerprint);
        self.hub.set_fingerprint(conn, fp.clone());

        let server_files = self.stat_playlist(&room).await;
        let result = {
            let mut guard = room.write();
            self.bsl.record_folder_report(
                &mut guard,
                conn.clone(),
                fp,
                display_name,
                files,
                &server_files,
            )
        };

        self.hub
            .send_to(conn, &ServerEvent::BslMatchResult(result));
        self.notify_admin_bsl(&code, &room);
        self.event_log
            .append_room(&code, "bsl-folder-selected", json!({"connection": conn.as_str()}))
            .await;
        Ok(())
    }

    fn on_bsl_manual_match(
        &self,
        conn: &ConnectionId,
        client_connection_id: &str,
        client_file_name: &str,
        playlist_index: i32,
    ) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        validation::validate_filename(client_file_name)?;
        let target = ConnectionId::from_string(client_connection_id.to_string());
        {
            let mut guard = room.write();
            self.bsl
                .manual_match(&mut guard, &target, client_file_name, playlist_index)?;
        }
        self.notify_admin_bsl(&code, &room);
        Ok(())
    }

    fn on_bsl_set_drift(
        &self,
        conn: &ConnectionId,
        client_fingerprint: &str,
        playlist_index: i32,
        drift_seconds: i32,
    ) -> Result<()> {
        let (code, room) = self.require_room(conn)?;
        let fp = Fingerprint::from(client_fingerprint);
        let drift_values = {
            let mut guard = room.write();
            validation::validate_playlist_index(playlist_index, guard.playlist.len())?;
            guard.drift.set(fp.clone(), playlist_index, drift_seconds);
            guard.drift.values_for(&fp)
        };

        // Drift is per-device state: only connections of that fingerprint
        // hear about it; the shared playback tuple is untouched.
        self.hub.send_to_fingerprint(
            &code,
            &fp,
            &ServerEvent::BslDriftUpdate { drift_values },
        );
        self.notify_admin_bsl(&code, &room);
        Ok(())
    }

    // ----- clients & chat -------------------------------------------------

    fn on_client_register(&self, conn: &ConnectionId, fingerprint: String) {
        let fp = Fingerprint::from(fingerprint);
        self.hub.set_fingerprint(conn, fp.clone());

        let remembered = self.chat.remembered_name(&fp);
        if let Some((_, room)) = self.current_room(conn) {
            let mut guard = room.write();
            if let Some(viewer) = guard.viewers.get_mut(conn) {
                viewer.fingerprint = Some(fp);
                if let Some(name) = &remembered {
                    viewer.display_name = name.clone();
                }
            }
        }
        if let Some(name) = remembered {
            self.hub.send_to(conn, &ServerEvent::NameUpdated { name });
        }
    }

    fn on_get_client_list(&self, conn: &ConnectionId) -> Result<()> {
        let (_, room) = self.require_room(conn)?;
        let clients: Vec<ClientEntry> = {
            let guard = room.read();
            guard
                .viewers
                .iter()
                .map(|(id, viewer)| ClientEntry {
                    connection_id: id.as_str().to_string(),
                    fingerprint: viewer.fingerprint.as_ref().map(|f| f.as_str().to_string()),
                    display_name: viewer.display_name.clone(),
                })
                .collect()
        };
        self.hub.send_to(conn, &ServerEvent::ClientList(clients));
        Ok(())
    }

    fn on_set_client_name(
        &self,
        conn: &ConnectionId,
        client_id: &str,
        display_name: &str,
    ) -> Result<()> {
        let (_, room) = self.require_room(conn)?;
        let target = ConnectionId::from_string(client_id.to_string());
        let fp = {
            let guard = room.read();
            guard
                .viewers
                .get(&target)
                .ok_or_else(|| Error::NotFound("No such client".into()))?
                .fingerprint
                .clone()
        };

        let escaped = match &fp {
            Some(fp) => self.chat.set_display_name(fp, display_name)?,
            None => roomcast_core::service::escape_html(display_name.trim()),
        };
        {
            let mut guard = room.write();
            if let Some(viewer) = guard.viewers.get_mut(&target) {
                viewer.display_name = escaped.clone();
            }
        }
        self.hub
            .send_to(&target, &ServerEvent::NameUpdated { name: escaped });
        Ok(())
    }

    fn on_set_client_display_name(
        &self,
        conn: &ConnectionId,
        fingerprint: &str,
        display_name: &str,
    ) -> Result<()> {
        let (_, room) = self.require_room(conn)?;
        let fp = Fingerprint::from(fingerprint);
        let escaped = self.chat.set_display_name(&fp, display_name)?;

        let targets = {
            let mut guard = room.write();
            let targets = guard.connections_for_fingerprint(&fp);
            for target in &targets {
                if let Some(viewer) = guard.viewers.get_mut(target) {
                    viewer.display_name = escaped.clone();
                }
            }
            targets
        };
        for target in targets {
            self.hub.send_to(
                &target,
                &ServerEvent::NameUpdated {
                    name: escaped.clone(),
                },
            );
        }
        Ok(())
    }

    async fn on_chat_message(
        &self,
        conn: &ConnectionId,
        sender: &str,
        message: &str,
    ) -> Result<()> {
        if !self.config.chat_enabled {
            return Ok(());
        }
        let (code, room) = self.require_room(conn)?;
        let fp = self.hub.meta(conn).and_then(|m| m.fingerprint);

        match self.chat.process(sender, message, fp.as_ref())? {
            ChatOutcome::Broadcast { sender, message } => {
                self.hub.broadcast_room(
                    &code,
                    &ServerEvent::ChatMessage { sender, message },
                );
            }
            ChatOutcome::Rename {
                new_name,
                system_message,
            } => {
                {
                    let mut guard = room.write();
                    if let Some(viewer) = guard.viewers.get_mut(conn) {
                        viewer.display_name = new_name.clone();
                    }
                }
                self.hub
                    .send_to(conn, &ServerEvent::NameUpdated { name: new_name });
                self.hub.broadcast_room(
                    &code,
                    &ServerEvent::ChatMessage {
                        sender: "System".to_string(),
                        message: system_message,
                    },
                );
            }
        }
        self.event_log
            .append_room(&code, "chat-message", json!({"connection": conn.as_str()}))
            .await;
        Ok(())
    }

    // ----- shared plumbing ------------------------------------------------

    fn current_room(&self, conn: &ConnectionId) -> Option<(RoomCode, SharedRoom)> {
        let code = self.hub.room_of(conn)?;
        self.registry.find(code.as_str())
    }

    fn require_room(&self, conn: &ConnectionId) -> Result<(RoomCode, SharedRoom)> {
        self.current_room(conn)
            .ok_or_else(|| Error::NotFound("Not in a room".to_string()))
    }

    fn is_room_admin(&self, conn: &ConnectionId) -> bool {
        self.current_room(conn)
            .is_some_and(|(_, room)| room.read().is_admin_connection(conn))
    }

    async fn join_room_internal(
        &self,
        conn: &ConnectionId,
        code: &RoomCode,
        room: &SharedRoom,
        fingerprint: Option<Fingerprint>,
        name: Option<String>,
    ) {
        // Drop membership in any previous room first.
        self.on_leave_room(conn);

        let display_name = fingerprint
            .as_ref()
            .and_then(|fp| self.chat.remembered_name(fp))
            .or_else(|| {
                name.map(|n| roomcast_core::service::escape_html(n.trim()))
                    .filter(|n| !n.is_empty())
            })
            .unwrap_or_else(|| "Viewer".to_string());

        {
            let mut guard = room.write();
            guard.viewers.insert(
                conn.clone(),
                ViewerInfo {
                    fingerprint: fingerprint.clone(),
                    display_name,
                    joined_at: Utc::now(),
                },
            );
        }
        self.hub.join_room(conn, code);
        if let Some(fp) = fingerprint {
            self.hub.set_fingerprint(conn, fp);
        }
    }

    fn reject_admin(&self, conn: &ConnectionId, error: &Error) {
        self.hub.send_to(
            conn,
            &ServerEvent::AdminAuthResult {
                success: false,
                reason: Some(error.to_string()),
            },
        );
        let hub = self.hub.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(AUTH_FAILURE_DISCONNECT).await;
            hub.unregister(&conn);
        });
    }

    fn broadcast_sync(&self, code: &RoomCode, room: &SharedRoom) {
        let event = {
            let guard = room.read();
            sync_event(&guard)
        };
        self.hub.broadcast_room(code, &event);
    }

    fn broadcast_playlist(&self, code: &RoomCode, room: &SharedRoom) {
        let event = {
            let guard = room.read();
            ServerEvent::PlaylistUpdate {
                playlist: guard.playlist.clone(),
            }
        };
        self.hub.broadcast_room(code, &event);
    }

    fn broadcast_position(&self, code: &RoomCode, room: &SharedRoom) {
        let event = {
            let guard = room.read();
            ServerEvent::PlaylistPosition {
                current_index: guard.playlist.current_index,
            }
        };
        self.hub.broadcast_room(code, &event);
    }

    fn broadcast_presence(&self, code: &RoomCode, room: &SharedRoom) {
        let count = room.read().viewer_count();
        let event = if self.config.server_mode {
            ServerEvent::ViewerCount(count)
        } else {
            ServerEvent::ClientCount(count)
        };
        self.hub.broadcast_room(code, &event);
    }

    fn send_bsl_status(&self, conn: &ConnectionId, _code: &RoomCode, room: &SharedRoom) {
        let status = {
            let guard = room.read();
            self.bsl.status(&guard)
        };
        self.hub
            .send_to(conn, &ServerEvent::BslStatusUpdate(status));
    }

    /// Push the consolidated status to the room's admin connection, if any.
    fn notify_admin_bsl(&self, _code: &RoomCode, room: &SharedRoom) {
        let (admin, status) = {
            let guard = room.read();
            (guard.admin_connection.clone(), self.bsl.status(&guard))
        };
        if let Some(admin) = admin {
            self.hub
                .send_to(&admin, &ServerEvent::BslStatusUpdate(status));
        }
    }

    /// Stat the server-side copies of local playlist items, outside any
    /// room lock.
    async fn stat_playlist(&self, room: &SharedRoom) -> Vec<ServerFileInfo> {
        let local_items: Vec<(i32, String)> = {
            let guard = room.read();
            guard
                .playlist
                .items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| {
                    item.filename().map(|name| (i as i32, name.to_string()))
                })
                .collect()
        };

        let mut infos = Vec::with_capacity(local_items.len());
        for (playlist_index, filename) in local_items {
            let size = self.media.file_size(&filename).await;
            infos.push(ServerFileInfo {
                playlist_index,
                filename,
                size,
            });
        }
        infos
    }
}

/// Authoritative sync tuple from a room's stored state.
fn sync_event(room: &Room) -> ServerEvent {
    ServerEvent::Sync {
        is_playing: room.playback.is_playing,
        position: room.playback.position,
        anchor: room.playback.anchor.timestamp_millis(),
        rate: room.playback.rate,
        audio_track: room.playback.audio_track,
        subtitle_track: room.playback.subtitle_track,
    }
}

impl Dispatcher {
    /// Wall-clock position of a room right now; exposed for the HTTP layer.
    #[must_use]
    pub fn room_position_now(&self, room: &SharedRoom) -> f64 {
        let guard = room.read();
        roomcast_core::clock::extrapolate(&guard.playback, Utc::now())
    }
}
