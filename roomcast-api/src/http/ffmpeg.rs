//! Media tool endpoints: password-gated (SHA-256 compared) job control.
//! Disabled entirely when no tools password is configured.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use roomcast_core::media::{jobs::list_encoders, JobRequest};
use roomcast_core::Error;

use super::csrf::session_from_cookies;
use super::error::{AppError, AppResult};
use super::AppState;
use crate::validation;

#[derive(Debug, Deserialize)]
pub struct AuthBody {
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPresetBody {
    pub filename: String,
    #[serde(flatten)]
    pub request: JobRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    pub job_id: String,
}

fn session_of(headers: &HeaderMap) -> Option<String> {
    session_from_cookies(headers.get(header::COOKIE).and_then(|v| v.to_str().ok()))
}

fn require_tool_session(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    if !state.config.ffmpeg_tools_enabled() {
        return Err(AppError(Error::Auth("Media tools are disabled".into())));
    }
    let authorized = session_of(headers)
        .is_some_and(|session| state.ffmpeg_sessions.contains_key(&session));
    if authorized {
        Ok(())
    } else {
        Err(AppError(Error::Auth("Media tools password required".into())))
    }
}

/// POST /api/ffmpeg/auth
pub async fn auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AuthBody>,
) -> AppResult<impl IntoResponse> {
    if !state.config.ffmpeg_tools_enabled() {
        return Err(AppError(Error::Auth("Media tools are disabled".into())));
    }
    let expected = Sha256::digest(state.config.ffmpeg_tools_password.as_bytes());
    let presented = Sha256::digest(body.password.as_bytes());
    if expected != presented {
        return Err(AppError(Error::Auth("Wrong media tools password".into())));
    }

    let session = session_of(&headers)
        .ok_or_else(|| AppError(Error::Auth("Session cookie required".into())))?;
    state.ffmpeg_sessions.insert(session, ());
    Ok(Json(json!({ "success": true })))
}

/// POST /api/ffmpeg/run-preset
pub async fn run_preset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RunPresetBody>,
) -> AppResult<impl IntoResponse> {
    require_tool_session(&state, &headers)?;
    validation::validate_filename(&body.filename)?;

    let job = state.jobs.submit(body.filename, body.request)?;
    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "jobId": job.id })),
    ))
}

/// POST /api/ffmpeg/cancel
pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CancelBody>,
) -> AppResult<impl IntoResponse> {
    require_tool_session(&state, &headers)?;
    if state.jobs.cancel(&body.job_id) {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(AppError(Error::NotFound(format!(
            "No such job: {}",
            body.job_id
        ))))
    }
}

/// GET /api/ffmpeg/jobs
pub async fn jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    require_tool_session(&state, &headers)?;
    Ok(Json(json!({ "jobs": state.jobs.list() })))
}

/// GET /api/ffmpeg/encoders
pub async fn encoders(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    require_tool_session(&state, &headers)?;
    let encoders = list_encoders().await?;
    Ok(Json(json!({ "encoders": encoders })))
}
