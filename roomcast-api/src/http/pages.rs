//! Server-rendered shell pages. The player UI itself is a static asset
//! concern; these handlers only provide the network-visible behavior: the
//! admin page binds the CSRF session cookie and, when hydration is on,
//! embeds the initial room state so the page skips one round trip.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse},
};
use serde_json::json;

use super::csrf::{session_cookie, session_from_cookies};
use super::AppState;

/// GET /. Landing page: room browser in rooms mode, player shell in
/// legacy mode.
pub async fn landing(State(state): State<AppState>) -> impl IntoResponse {
    if state.config.server_mode {
        Html(page_shell(
            "roomcast",
            &json!({ "mode": "landing", "rooms": state.dispatcher.registry.list_public() }),
        ))
    } else {
        Html(page_shell("roomcast", &json!({ "mode": "player" })))
    }
}

/// GET /watch/{room_code}
pub async fn watch(
    State(state): State<AppState>,
    Path(room_code): Path<String>,
) -> impl IntoResponse {
    let exists = state.dispatcher.registry.find(&room_code).is_some();
    if !exists {
        return (
            StatusCode::NOT_FOUND,
            Html(page_shell("roomcast", &json!({ "mode": "missing-room" }))),
        )
            .into_response();
    }
    Html(page_shell(
        "roomcast",
        &json!({ "mode": "player", "roomCode": room_code.to_uppercase() }),
    ))
    .into_response()
}

/// GET /admin
pub async fn admin(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    admin_page(state, headers, None)
}

/// GET /admin/{room_code}
pub async fn admin_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_code): Path<String>,
) -> impl IntoResponse {
    admin_page(state, headers, Some(room_code))
}

fn admin_page(
    state: AppState,
    headers: HeaderMap,
    room_code: Option<String>,
) -> axum::response::Response {
    // Bind (or reuse) the CSRF session on first admin-page hit.
    let existing = session_from_cookies(
        headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok()),
    );
    let (session, token, set_cookie) = match existing {
        Some(session) => {
            let token = state
                .csrf
                .token_for(&session)
                .unwrap_or_else(|| state.csrf.refresh(&session));
            (session, token, false)
        }
        None => {
            let (session, token) = state.csrf.issue();
            (session, token, true)
        }
    };

    let mut hydration = json!({ "mode": "admin" });
    if state.config.data_hydration {
        hydration["csrfToken"] = json!(token);
        if let Some(raw) = &room_code {
            if let Some((code, room)) = state.dispatcher.registry.find(raw) {
                let guard = room.read();
                hydration["room"] = json!({
                    "code": code,
                    "name": guard.name,
                    "playlist": guard.playlist,
                    "isPlaying": guard.playback.is_playing,
                    "position": guard.playback.position,
                    "rate": guard.playback.rate,
                    "viewerCount": guard.viewer_count(),
                });
            }
        }
    }

    let body = Html(page_shell("roomcast admin", &hydration));
    if set_cookie {
        ([(header::SET_COOKIE, session_cookie(&session))], body).into_response()
    } else {
        body.into_response()
    }
}

fn page_shell(title: &str, hydration: &serde_json::Value) -> String {
    format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title}</title>\n\
         </head>\n<body>\n<div id=\"app\"></div>\n\
         <script id=\"server-data\" type=\"application/json\">{hydration}</script>\n\
         <script src=\"/assets/app.js\"></script>\n</body>\n</html>\n"
    )
}
