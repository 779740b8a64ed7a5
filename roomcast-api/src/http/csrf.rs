//! CSRF protection for mutating HTTP endpoints: a `sync_session` cookie
//! bound to a random 32-byte token the page presents back via the
//! `X-CSRF-Token` header. Safe methods bypass; tokens expire after 24h.

use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::AppState;

/// Session cookie name.
pub const SESSION_COOKIE: &str = "sync_session";
/// Header mutating requests must carry.
pub const CSRF_HEADER: &str = "x-csrf-token";
/// Token lifetime.
pub const TOKEN_TTL_HOURS: i64 = 24;
/// Table size that triggers an expired-entry sweep.
const GC_THRESHOLD: usize = 1000;

#[derive(Debug, Clone)]
struct SessionToken {
    token: String,
    issued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CsrfService {
    sessions: DashMap<String, SessionToken>,
}

impl CsrfService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh session with its token.
    pub fn issue(&self) -> (String, String) {
        self.maybe_gc();
        let session_id = random_hex(16);
        let token = random_token();
        self.sessions.insert(
            session_id.clone(),
            SessionToken {
                token: token.clone(),
                issued_at: Utc::now(),
            },
        );
        (session_id, token)
    }

    /// Current token for a session, if the session is alive and unexpired.
    #[must_use]
    pub fn token_for(&self, session_id: &str) -> Option<String> {
        let entry = self.sessions.get(session_id)?;
        if Self::expired(&entry) {
            None
        } else {
            Some(entry.token.clone())
        }
    }

    /// Replace an expired (or lost) session's token.
    pub fn refresh(&self, session_id: &str) -> String {
        let token = random_token();
        self.sessions.insert(
            session_id.to_string(),
            SessionToken {
                token: token.clone(),
                issued_at: Utc::now(),
            },
        );
        token
    }

    /// Verify a `(session, token)` pair. The token compare is constant-time
    /// so a mismatch position cannot be probed.
    #[must_use]
    pub fn verify(&self, session_id: &str, presented: &str) -> bool {
        let Some(entry) = self.sessions.get(session_id) else {
            return false;
        };
        if Self::expired(&entry) {
            return false;
        }
        entry
            .token
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into()
    }

    fn expired(entry: &SessionToken) -> bool {
        Utc::now() - entry.issued_at > Duration::hours(TOKEN_TTL_HOURS)
    }

    /// Sweep expired sessions once the table grows past the threshold.
    fn maybe_gc(&self) {
        if self.sessions.len() <= GC_THRESHOLD {
            return;
        }
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| !Self::expired(entry));
        debug!(before, after = self.sessions.len(), "CSRF table swept");
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// 32 random bytes, URL-safe base64 without padding.
fn random_token() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, buf)
}

/// Pull the `sync_session` cookie out of a Cookie header value.
#[must_use]
pub fn session_from_cookies(cookie_header: Option<&str>) -> Option<String> {
    let header = cookie_header?;
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Set-Cookie value binding a session to the browser.
#[must_use]
pub fn session_cookie(session_id: &str) -> String {
    format!("{SESSION_COOKIE}={session_id}; HttpOnly; SameSite=Strict; Path=/")
}

/// Middleware: mutating methods must present a valid `(sync_session,
/// X-CSRF-Token)` pair; GET/HEAD/OPTIONS pass through.
pub async fn csrf_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    ) {
        return next.run(request).await;
    }

    let session = session_from_cookies(
        request
            .headers()
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok()),
    );
    let token = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok());

    match (session, token) {
        (Some(session), Some(token)) if state.csrf.verify(&session, token) => {
            next.run(request).await
        }
        _ => (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({
                "error": "CSRF token missing or invalid"
            })),
        )
            .into_response(),
    }
}
