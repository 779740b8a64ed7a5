//! HTTP router and shared application state.

pub mod api;
pub mod csrf;
pub mod error;
pub mod ffmpeg;
pub mod pages;

use axum::{
    middleware as axum_middleware,
    routing::{any, get, post},
    Router,
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use roomcast_core::media::{JobQueue, ManifestStore, MediaLibrary, ThumbnailCache};
use roomcast_core::Config;

use crate::dispatch::Dispatcher;
use csrf::CsrfService;

pub use error::{AppError, AppResult};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub csrf: Arc<CsrfService>,
    pub media: Arc<dyn MediaLibrary>,
    pub manifests: ManifestStore,
    pub jobs: Arc<JobQueue>,
    pub thumbs: ThumbnailCache,
    pub tracks_dir: std::path::PathBuf,
    /// CSRF sessions that have passed the media tools password.
    pub ffmpeg_sessions: Arc<DashMap<String, ()>>,
    /// Thumbnail rate windows per address.
    pub thumb_windows: Arc<DashMap<IpAddr, (u32, Instant)>>,
    pub started_at: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        dispatcher: Arc<Dispatcher>,
        media: Arc<dyn MediaLibrary>,
        manifests: ManifestStore,
        jobs: Arc<JobQueue>,
    ) -> Self {
        let tracks_dir = config.data_dir.join("tracks");
        Self {
            config,
            dispatcher,
            csrf: Arc::new(CsrfService::new()),
            media,
            manifests,
            jobs,
            thumbs: ThumbnailCache::new(),
            tracks_dir,
            ffmpeg_sessions: Arc::new(DashMap::new()),
            thumb_windows: Arc::new(DashMap::new()),
            started_at: Instant::now(),
        }
    }
}

/// Build the full HTTP router.
pub fn create_router(state: AppState) -> Router {
    let rest = Router::new()
        .route("/api/health", get(api::health))
        .route("/api/csrf-token", get(api::csrf_token))
        .route("/api/files", get(api::list_files))
        .route("/api/tracks/orphans", get(api::orphan_tracks))
        .route("/api/tracks/{filename}", get(api::tracks_for))
        .route("/api/thumbnail/{filename}", get(api::thumbnail))
        .route("/thumbs/{name}", get(api::thumbnail_file))
        .route("/api/server-mode", get(api::server_mode))
        .route("/api/rooms", get(api::list_rooms))
        .route("/api/rooms/{code}", get(api::room_info))
        .route("/api/ffmpeg/auth", post(ffmpeg::auth))
        .route("/api/ffmpeg/run-preset", post(ffmpeg::run_preset))
        .route("/api/ffmpeg/cancel", post(ffmpeg::cancel))
        .route("/api/ffmpeg/jobs", get(ffmpeg::jobs))
        .route("/api/ffmpeg/encoders", get(ffmpeg::encoders))
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    Router::new()
        .route("/", get(pages::landing))
        .route("/admin", get(pages::admin))
        .route("/admin/{room_code}", get(pages::admin_room))
        .route("/watch/{room_code}", get(pages::watch))
        .route("/ws", any(crate::ws::websocket_handler))
        .merge(rest)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            csrf::csrf_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
