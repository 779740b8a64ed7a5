//! JSON REST surface: media listing, tracks, thumbnails, rooms, health.

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use roomcast_core::media::MediaLibrary;
use roomcast_core::Error;

use super::csrf::{session_cookie, session_from_cookies};
use super::error::{AppError, AppResult};
use super::AppState;
use crate::validation;

/// Thumbnail requests allowed per address per minute.
const THUMBNAILS_PER_MINUTE: u32 = 50;

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed();
    Json(json!({
        "status": "ok",
        "uptime": humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string(),
        "rooms": state.dispatcher.registry.room_count(),
        "connections": state.dispatcher.hub.connection_count(),
    }))
}

/// GET /api/csrf-token: returns the session's token, minting a session
/// (and cookie) when the browser has none yet.
pub async fn csrf_token(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let existing = session_from_cookies(
        headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok()),
    );

    if let Some(session) = existing {
        // Expired tokens are replaced in place so the page can recover
        // without a reload.
        let token = state
            .csrf
            .token_for(&session)
            .unwrap_or_else(|| state.csrf.refresh(&session));
        return (StatusCode::OK, Json(json!({ "token": token }))).into_response();
    }

    let (session, token) = state.csrf.issue();
    (
        StatusCode::OK,
        [(header::SET_COOKIE, session_cookie(&session))],
        Json(json!({ "token": token })),
    )
        .into_response()
}

/// GET /api/files: cached media list; rate-limited.
pub async fn list_files(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> AppResult<impl IntoResponse> {
    state.dispatcher.rate_limiter.check(addr.ip())?;
    let files = state.media.list_media().await?;
    Ok(Json(json!({ "files": files })))
}

/// GET /api/tracks/{filename}
pub async fn tracks_for(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(filename): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.dispatcher.rate_limiter.check(addr.ip())?;
    validation::validate_filename(&filename)?;
    let tracks = state.media.tracks_for(&filename).await?;
    Ok(Json(json!({
        "audio": tracks.audio,
        "subtitles": tracks.subtitles,
    })))
}

/// GET /api/tracks/orphans: sidecar files no manifest references.
pub async fn orphan_tracks(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let referenced = state.manifests.referenced_sidecars().await;
    let mut orphans = Vec::new();

    let mut dir = match tokio::fs::read_dir(&state.tracks_dir).await {
        Ok(dir) => dir,
        Err(_) => return Ok(Json(json!({ "orphans": [] }))),
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let path = entry.path();
        if path.is_file() && !referenced.contains(&path) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                orphans.push(name.to_string());
            }
        }
    }
    orphans.sort();
    Ok(Json(json!({ "orphans": orphans })))
}

#[derive(Debug, Deserialize)]
pub struct ThumbnailParams {
    #[serde(default = "default_width")]
    pub width: u32,
}

const fn default_width() -> u32 {
    roomcast_core::media::LEGACY_WIDTH
}

/// GET /api/thumbnail/{filename}?width=N, limited to 50/min per address.
pub async fn thumbnail(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(filename): Path<String>,
    Query(params): Query<ThumbnailParams>,
) -> AppResult<impl IntoResponse> {
    check_thumbnail_limit(&state, addr)?;
    validation::validate_filename(&filename)?;
    let width = params.width.clamp(64, 1920);

    let path = state
        .thumbs
        .ensure(&state.config.media_dir, &filename, width)
        .await?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    Ok(Json(json!({ "thumbnail": format!("/thumbs/{name}") })))
}

/// GET /thumbs/{name}: serve a generated thumbnail.
pub async fn thumbnail_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<impl IntoResponse> {
    validation::validate_filename(&name)?;
    let path = state.thumbs.path_in_cache(&name);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| Error::NotFound(format!("No thumbnail {name}")))?;
    Ok((
        [(header::CONTENT_TYPE, "image/jpeg")],
        bytes,
    ))
}

fn check_thumbnail_limit(state: &AppState, addr: SocketAddr) -> Result<(), AppError> {
    let now = Instant::now();
    let mut entry = state
        .thumb_windows
        .entry(addr.ip())
        .or_insert((0u32, now));
    let (count, window_start) = *entry;
    if now.duration_since(window_start) > Duration::from_secs(60) {
        *entry = (1, now);
        return Ok(());
    }
    if count >= THUMBNAILS_PER_MINUTE {
        return Err(AppError(Error::RateLimit {
            retry_after_seconds: 60,
        }));
    }
    *entry = (count + 1, window_start);
    Ok(())
}

/// GET /api/server-mode: the client-visible configuration surface.
pub async fn server_mode(State(state): State<AppState>) -> impl IntoResponse {
    let config = &state.config;
    Json(json!({
        "serverMode": config.server_mode,
        "chatEnabled": config.chat_enabled,
        "clientControlsDisabled": config.client_controls_disabled,
        "clientSyncDisabled": config.client_sync_disabled,
        "volumeStep": config.volume_step,
        "maxVolume": config.max_volume,
        "skipSeconds": config.skip_seconds,
        "skipIntroSeconds": config.skip_intro_seconds,
        "subtitleRenderer": config.effective_subtitle_renderer(),
        "dataHydration": config.data_hydration,
    }))
}

/// GET /api/rooms: public rooms.
pub async fn list_rooms(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "rooms": state.dispatcher.registry.list_public() }))
}

/// GET /api/rooms/{code}
pub async fn room_info(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> AppResult<impl IntoResponse> {
    let (room_code, room) = state
        .dispatcher
        .registry
        .find(&code)
        .ok_or_else(|| Error::NotFound("Room not found".to_string()))?;
    let position = state.dispatcher.room_position_now(&room);
    let guard = room.read();
    Ok(Json(json!({
        "code": room_code,
        "name": guard.name,
        "viewers": guard.viewer_count(),
        "createdAt": guard.created_at,
        "private": guard.private,
        "isPlaying": guard.playback.is_playing,
        "position": position,
    })))
}
